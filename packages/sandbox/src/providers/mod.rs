// ABOUTME: Provider and Sandbox traits for the tutorial execution environment
// ABOUTME: Defines filesystem, process spawn, and port/filesystem event primitives

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tutorbox_core::{FileContent, FileSystemNode, FileSystemTree, Files};

use crate::error::Result;

pub mod local;
pub mod memory;

pub use local::{LocalProvider, LocalSandbox};
pub use memory::{MemoryProvider, MemorySandbox, ScriptedProcess, SpawnRecord};

/// Capacity of the port and filesystem event channels
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Exit code reported for processes killed through [`ProcessHandle::kill`]
pub const KILLED_EXIT_CODE: i32 = 130;

/// Options passed to [`Provider::boot`]
#[derive(Debug, Clone)]
pub struct BootOptions {
    /// Name of the working directory processes start in
    pub workdir_name: String,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            workdir_name: "tutorial".to_string(),
        }
    }
}

/// Pseudo-terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub terminal: Option<TerminalSize>,
    pub env: HashMap<String, String>,
}

/// Handle to a process running inside the sandbox.
///
/// The sandbox sends every output chunk before resolving `exit`.
#[derive(Debug)]
pub struct ProcessHandle {
    pub input: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
    pub resize: mpsc::UnboundedSender<TerminalSize>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn new(
        input: mpsc::UnboundedSender<String>,
        output: mpsc::UnboundedReceiver<String>,
        exit: oneshot::Receiver<i32>,
        resize: mpsc::UnboundedSender<TerminalSize>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            input,
            output,
            exit,
            resize,
            kill,
        }
    }

    /// Ask the sandbox to terminate the process. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// Sandbox-side ends of a [`ProcessHandle`]
#[derive(Debug)]
pub struct ProcessChannels {
    pub input: mpsc::UnboundedReceiver<String>,
    pub output: mpsc::UnboundedSender<String>,
    pub exit: oneshot::Sender<i32>,
    pub resize: mpsc::UnboundedReceiver<TerminalSize>,
    pub kill: CancellationToken,
}

/// Create a connected handle/channels pair.
pub fn process_pair() -> (ProcessHandle, ProcessChannels) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (resize_tx, resize_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();

    (
        ProcessHandle::new(input_tx, output_rx, exit_rx, resize_tx, kill.clone()),
        ProcessChannels {
            input: input_rx,
            output: output_tx,
            exit: exit_tx,
            resize: resize_rx,
            kill,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    Open,
    Close,
}

/// Network binding change reported by the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub port: u16,
    pub kind: PortEventKind,
    pub url: String,
}

impl PortEvent {
    pub fn open(port: u16, url: impl Into<String>) -> Self {
        Self {
            port,
            kind: PortEventKind::Open,
            url: url.into(),
        }
    }

    pub fn close(port: u16, url: impl Into<String>) -> Self {
        Self {
            port,
            kind: PortEventKind::Close,
            url: url.into(),
        }
    }
}

/// Filesystem change notification. `paths` is a hint; it may be empty when the
/// sandbox cannot tell which paths changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsEvent {
    pub paths: Vec<String>,
}

/// Backend able to boot sandboxes
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name used in logs
    fn name(&self) -> &str;

    /// Boot a new sandbox
    async fn boot(&self, options: &BootOptions) -> Result<Arc<dyn Sandbox>>;
}

/// A booted sandbox. Paths are absolute-style (`/src/index.js`) and relative
/// to the sandbox working directory.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Mount a directory tree at the working directory root, overwriting
    /// files that already exist
    async fn mount(&self, tree: &FileSystemTree) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<FileContent>;

    /// Write a file, creating parent directories as needed
    async fn write_file(&self, path: &str, content: &FileContent) -> Result<()>;

    /// Create a directory and its parents
    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rm(&self, path: &str, recursive: bool) -> Result<()>;

    /// Read every file under the working directory, skipping dependency folders
    async fn snapshot(&self) -> Result<Files>;

    /// Start `program` with `args`
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle>;

    fn subscribe_ports(&self) -> broadcast::Receiver<PortEvent>;

    fn subscribe_fs(&self) -> broadcast::Receiver<FsEvent>;
}

/// Render a program and its arguments as a single command line for logs and
/// scripted lookups. `sh -c "npm install"` renders as `npm install`.
pub fn command_line(program: &str, args: &[String]) -> String {
    match args {
        [flag, command, ..] if flag == "-c" => command.clone(),
        [] => program.to_string(),
        _ => format!("{} {}", program, args.join(" ")),
    }
}

/// Directories never included in snapshots
pub fn is_ignored_path(path: &str) -> bool {
    path.split('/')
        .any(|segment| segment == "node_modules" || segment == ".git")
}

/// Paths of every directory in `tree`, parents before children
pub(crate) fn tree_directories(tree: &FileSystemTree) -> Vec<String> {
    fn walk(prefix: &str, tree: &FileSystemTree, out: &mut Vec<String>) {
        for (name, node) in tree {
            if let FileSystemNode::Directory { entries } = node {
                let path = format!("{}/{}", prefix, name);
                out.push(path.clone());
                walk(&path, entries, out);
            }
        }
    }

    let mut out = Vec::new();
    walk("", tree, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("jsh", &["-c".to_string(), "npm install".to_string()]),
            "npm install"
        );
        assert_eq!(command_line("ls", &[]), "ls");
        assert_eq!(
            command_line("node", &["index.js".to_string(), "--watch".to_string()]),
            "node index.js --watch"
        );
    }

    #[test]
    fn test_ignored_paths() {
        assert!(is_ignored_path("/node_modules/react/index.js"));
        assert!(is_ignored_path("/packages/a/node_modules/x"));
        assert!(is_ignored_path("/.git/HEAD"));
        assert!(!is_ignored_path("/src/node_modules.txt"));
    }

    #[test]
    fn test_tree_directories() {
        let files = tutorbox_core::files_from([("/src/lib/a.js", "a"), ("/b.js", "b")]);
        let tree = tutorbox_core::to_file_tree(&files);
        assert_eq!(tree_directories(&tree), vec!["/src", "/src/lib"]);
    }

    #[tokio::test]
    async fn test_process_pair_connects_both_ends() {
        let (mut handle, channels) = process_pair();
        channels.output.send("hello".to_string()).unwrap();
        channels.exit.send(0).unwrap();

        assert_eq!(handle.output.recv().await, Some("hello".to_string()));
        assert_eq!((&mut handle.exit).await, Ok(0));

        handle.kill();
        assert!(channels.kill.is_cancelled());
    }
}
