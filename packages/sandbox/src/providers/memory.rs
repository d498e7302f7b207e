// ABOUTME: In-memory sandbox provider with scripted process outcomes
// ABOUTME: Lets callers drive port and filesystem events by hand for tests and dry runs

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, info};
use tutorbox_core::{flatten_tree, normalize_path, FileContent, FileSystemTree, Files};

use super::{
    command_line, is_ignored_path, process_pair, tree_directories, BootOptions, FsEvent,
    PortEvent, ProcessHandle, Provider, Sandbox, SpawnOptions, TerminalSize, EVENT_CHANNEL_SIZE,
    KILLED_EXIT_CODE,
};
use crate::error::{Result, SandboxError};

/// Outcome of a process spawned in a [`MemorySandbox`]. Commands without a
/// script exit with code 0 and print nothing.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProcess {
    output: Vec<String>,
    exit_code: i32,
    writes: Files,
    ports: Vec<u16>,
    hold: Option<Arc<Notify>>,
}

impl ScriptedProcess {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, chunk: impl Into<String>) -> Self {
        self.output.push(chunk.into());
        self
    }

    /// File written by the process after its output
    pub fn with_write(mut self, path: &str, content: impl Into<FileContent>) -> Self {
        self.writes.insert(normalize_path(path), content.into());
        self
    }

    /// Port opened by the process after its writes
    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Keep the process running until `release` is notified (`notify_one`)
    /// or the process is killed.
    pub fn held_by(mut self, release: Arc<Notify>) -> Self {
        self.hold = Some(release);
        self
    }
}

/// A process started in a [`MemorySandbox`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub command: String,
    pub program: String,
    pub args: Vec<String>,
    pub terminal: Option<TerminalSize>,
}

#[derive(Debug, Default)]
struct MemoryFs {
    files: Files,
    directories: BTreeSet<String>,
}

impl MemoryFs {
    fn add_parents(&mut self, path: &str) {
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if let Some((_, parents)) = segments.split_last() {
            for segment in parents {
                current.push('/');
                current.push_str(segment);
                self.directories.insert(current.clone());
            }
        }
    }

    fn write(&mut self, path: String, content: FileContent) {
        self.add_parents(&path);
        self.files.insert(path, content);
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir);
        self.files.keys().any(|p| p.starts_with(&prefix))
            || self.directories.iter().any(|d| d.starts_with(&prefix))
    }

    fn remove_tree(&mut self, dir: &str) {
        let prefix = format!("{}/", dir);
        self.files.retain(|p, _| !p.starts_with(&prefix));
        self.directories.retain(|d| d != dir && !d.starts_with(&prefix));
    }
}

/// Provider handing out one shared [`MemorySandbox`]
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    sandbox: Arc<MemorySandbox>,
    boots: Arc<AtomicUsize>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            sandbox: Arc::new(MemorySandbox::new()),
            boots: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The sandbox returned by every boot, for scripting and inspection
    pub fn sandbox(&self) -> Arc<MemorySandbox> {
        self.sandbox.clone()
    }

    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn boot(&self, options: &BootOptions) -> Result<Arc<dyn Sandbox>> {
        let count = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        info!(workdir = %options.workdir_name, boots = count, "Booted memory sandbox");
        Ok(self.sandbox.clone())
    }
}

#[derive(Debug)]
pub struct MemorySandbox {
    fs: Arc<RwLock<MemoryFs>>,
    scripts: Mutex<HashMap<String, ScriptedProcess>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    mounts: AtomicUsize,
    port_tx: broadcast::Sender<PortEvent>,
    fs_tx: broadcast::Sender<FsEvent>,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySandbox {
    pub fn new() -> Self {
        let (port_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (fs_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            fs: Arc::new(RwLock::new(MemoryFs::default())),
            scripts: Mutex::new(HashMap::new()),
            spawned: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
            mounts: AtomicUsize::new(0),
            port_tx,
            fs_tx,
        }
    }

    /// Script the outcome of `command` (as passed to `sh -c`).
    pub fn script(&self, command: impl Into<String>, process: ScriptedProcess) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.into(), process);
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spawned_commands(&self) -> Vec<String> {
        self.spawned().into_iter().map(|r| r.command).collect()
    }

    /// Terminal resizes received by running processes, in order
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Every file, including ignored folders
    pub async fn files(&self) -> Files {
        self.fs.read().await.files.clone()
    }

    pub async fn has_directory(&self, path: &str) -> bool {
        self.fs
            .read()
            .await
            .directories
            .contains(&normalize_path(path))
    }

    /// Report a port change as if a process bound or released it.
    pub fn emit_port(&self, event: PortEvent) {
        let _ = self.port_tx.send(event);
    }

    /// Write a file as if a process inside the sandbox did it.
    pub async fn write_external(&self, path: &str, content: impl Into<FileContent>) {
        let path = normalize_path(path);
        self.fs.write().await.write(path.clone(), content.into());
        self.notify_fs(vec![path]);
    }

    /// Delete a file as if a process inside the sandbox did it.
    pub async fn remove_external(&self, path: &str) {
        let path = normalize_path(path);
        self.fs.write().await.files.remove(&path);
        self.notify_fs(vec![path]);
    }

    fn notify_fs(&self, paths: Vec<String>) {
        let _ = self.fs_tx.send(FsEvent { paths });
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn mount(&self, tree: &FileSystemTree) -> Result<()> {
        let files = flatten_tree(tree);
        let dirs = tree_directories(tree);

        let paths: Vec<String> = files.keys().cloned().collect();
        {
            let mut fs = self.fs.write().await;
            fs.directories.extend(dirs);
            for (path, content) in files {
                fs.write(path, content);
            }
        }

        let mounts = self.mounts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(files = paths.len(), mounts, "Mounted tree into memory sandbox");
        self.notify_fs(paths);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let path = normalize_path(path);
        self.fs
            .read()
            .await
            .files
            .get(&path)
            .cloned()
            .ok_or(SandboxError::NotFound(path))
    }

    async fn write_file(&self, path: &str, content: &FileContent) -> Result<()> {
        let path = normalize_path(path);
        self.fs.write().await.write(path.clone(), content.clone());
        self.notify_fs(vec![path]);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        {
            let mut fs = self.fs.write().await;
            if fs.files.contains_key(&path) {
                return Err(SandboxError::filesystem(&path, "a file exists at this path"));
            }
            fs.add_parents(&path);
            fs.directories.insert(path.clone());
        }
        self.notify_fs(vec![path]);
        Ok(())
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize_path(path);
        {
            let mut fs = self.fs.write().await;
            if fs.files.remove(&path).is_none() {
                if !fs.directories.contains(&path) {
                    return Err(SandboxError::NotFound(path));
                }
                if !recursive && fs.has_children(&path) {
                    return Err(SandboxError::filesystem(&path, "directory not empty"));
                }
                fs.remove_tree(&path);
            }
        }
        self.notify_fs(vec![path]);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Files> {
        Ok(self
            .fs
            .read()
            .await
            .files
            .iter()
            .filter(|(path, _)| !is_ignored_path(path))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect())
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle> {
        let command = command_line(program, args);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command)
            .cloned()
            .unwrap_or_default();

        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SpawnRecord {
                command: command.clone(),
                program: program.to_string(),
                args: args.to_vec(),
                terminal: options.terminal,
            });
        debug!(command = %command, "Spawning scripted process");

        let (handle, mut channels) = process_pair();
        let fs = self.fs.clone();
        let fs_tx = self.fs_tx.clone();
        let port_tx = self.port_tx.clone();
        let resizes = self.resizes.clone();

        tokio::spawn(async move {
            for chunk in script.output {
                let _ = channels.output.send(chunk);
            }

            if !script.writes.is_empty() {
                let paths: Vec<String> = script.writes.keys().cloned().collect();
                {
                    let mut fs = fs.write().await;
                    for (path, content) in script.writes {
                        fs.write(path, content);
                    }
                }
                let _ = fs_tx.send(FsEvent { paths });
            }

            for port in script.ports {
                let _ = port_tx.send(PortEvent::open(port, format!("http://localhost:{}", port)));
            }

            let mut exit_code = script.exit_code;
            if let Some(release) = script.hold {
                loop {
                    tokio::select! {
                        _ = channels.kill.cancelled() => {
                            exit_code = KILLED_EXIT_CODE;
                            break;
                        }
                        _ = release.notified() => break,
                        Some(size) = channels.resize.recv() => {
                            resizes.lock().unwrap_or_else(PoisonError::into_inner).push(size);
                        }
                        Some(line) = channels.input.recv() => {
                            let _ = channels.output.send(line);
                        }
                    }
                }
            }

            let _ = channels.exit.send(exit_code);
        });

        Ok(handle)
    }

    fn subscribe_ports(&self) -> broadcast::Receiver<PortEvent> {
        self.port_tx.subscribe()
    }

    fn subscribe_fs(&self) -> broadcast::Receiver<FsEvent> {
        self.fs_tx.subscribe()
    }
}
