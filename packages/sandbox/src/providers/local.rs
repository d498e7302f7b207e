// ABOUTME: Local sandbox provider backed by a temporary directory and host processes
// ABOUTME: Detects ports from process output and reports filesystem changes via notify

use async_trait::async_trait;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tutorbox_core::{flatten_tree, normalize_path, FileContent, FileSystemTree, Files};
use walkdir::WalkDir;

use super::{
    command_line, is_ignored_path, process_pair, tree_directories, BootOptions, FsEvent,
    PortEvent, ProcessChannels, ProcessHandle, Provider, Sandbox, SpawnOptions,
    EVENT_CHANNEL_SIZE, KILLED_EXIT_CODE,
};
use crate::error::{Result, SandboxError};

const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

fn port_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d{2,5})").ok()
        })
        .as_ref()
}

/// Extract a port announced in a line of process output.
pub fn detect_port(line: &str) -> Option<u16> {
    port_pattern()?
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Provider running commands on the host inside a fresh temporary directory
#[derive(Debug, Clone)]
pub struct LocalProvider {
    watch: bool,
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProvider {
    pub fn new() -> Self {
        Self { watch: true }
    }

    /// Provider that does not install a filesystem watcher
    pub fn without_watcher() -> Self {
        Self { watch: false }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn boot(&self, options: &BootOptions) -> Result<Arc<dyn Sandbox>> {
        let dir = tempfile::Builder::new()
            .prefix("tutorbox-")
            .tempdir()
            .map_err(|e| SandboxError::BootFailed(e.to_string()))?;
        let workdir = dir.path().join(&options.workdir_name);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::BootFailed(e.to_string()))?;
        let root = tokio::fs::canonicalize(&workdir)
            .await
            .map_err(|e| SandboxError::BootFailed(e.to_string()))?;

        let sandbox = Arc::new(LocalSandbox::new(dir, root));
        if self.watch {
            sandbox.start_watcher()?;
        }

        info!(root = %sandbox.root().display(), "Booted local sandbox");
        Ok(sandbox)
    }
}

pub struct LocalSandbox {
    _dir: TempDir,
    root: PathBuf,
    watcher: Mutex<Option<Debouncer<notify::RecommendedWatcher>>>,
    port_tx: broadcast::Sender<PortEvent>,
    fs_tx: broadcast::Sender<FsEvent>,
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("root", &self.root)
            .finish()
    }
}

impl LocalSandbox {
    fn new(dir: TempDir, root: PathBuf) -> Self {
        let (port_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (fs_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            _dir: dir,
            root,
            watcher: Mutex::new(None),
            port_tx,
            fs_tx,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a sandbox path. `..` segments are rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        let relative = normalized.trim_start_matches('/');
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SandboxError::filesystem(path, "path escapes the sandbox"));
        }
        Ok(self.root.join(relative))
    }

    fn start_watcher(&self) -> Result<()> {
        let root = self.root.clone();
        let fs_tx = self.fs_tx.clone();

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |res: std::result::Result<Vec<DebouncedEvent>, notify::Error>| {
                let events = match res {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "Filesystem watcher error");
                        return;
                    }
                };

                let paths: BTreeSet<String> = events
                    .iter()
                    .filter(|event| event.kind == DebouncedEventKind::Any)
                    .filter_map(|event| sandbox_path(&root, &event.path))
                    .filter(|path| !is_ignored_path(path))
                    .collect();

                if !paths.is_empty() {
                    let _ = fs_tx.send(FsEvent {
                        paths: paths.into_iter().collect(),
                    });
                }
            },
        )
        .map_err(|e| SandboxError::Watch(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&self.root, notify::RecursiveMode::Recursive)
            .map_err(|e| SandboxError::Watch(e.to_string()))?;

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(debouncer);
        debug!(root = %self.root.display(), "Watching sandbox filesystem");
        Ok(())
    }
}

/// Sandbox path (`/a/b`) of a host path under `root`.
fn sandbox_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        None
    } else {
        Some(normalize_path(&joined))
    }
}

fn map_io(path: &str, error: std::io::Error) -> SandboxError {
    if error.kind() == std::io::ErrorKind::NotFound {
        SandboxError::NotFound(normalize_path(path))
    } else {
        SandboxError::filesystem(path, error)
    }
}

fn read_tree(root: &Path) -> Result<Files> {
    let mut files = Files::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0 || (name != "node_modules" && name != ".git")
        });

    for entry in walker {
        let entry = entry.map_err(|e| SandboxError::filesystem(root.display().to_string(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = sandbox_path(root, entry.path()) else {
            continue;
        };
        let bytes = std::fs::read(entry.path()).map_err(|e| map_io(&path, e))?;
        files.insert(path, FileContent::from_bytes(bytes));
    }

    Ok(files)
}

async fn pump_lines<R>(
    reader: R,
    output: mpsc::UnboundedSender<String>,
    ports: Arc<Mutex<BTreeSet<u16>>>,
    port_tx: broadcast::Sender<PortEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(port) = detect_port(&line) {
                    let is_new = ports
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(port);
                    if is_new {
                        debug!(port, "Detected port in process output");
                        let _ = port_tx.send(PortEvent::open(port, local_url(port)));
                    }
                }
                let _ = output.send(format!("{}\n", line));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

/// Kill `child` together with everything in its process group.
async fn kill_process_group(child: &mut Child, command: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(command = %command, pid, error = %e, "Failed to signal process group");
        }
    }

    if let Err(e) = child.kill().await {
        warn!(command = %command, error = %e, "Failed to kill process");
    }
}

fn local_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn mount(&self, tree: &FileSystemTree) -> Result<()> {
        for dir in tree_directories(tree) {
            let target = self.resolve(&dir)?;
            tokio::fs::create_dir_all(&target)
                .await
                .map_err(|e| map_io(&dir, e))?;
        }

        let files = flatten_tree(tree);
        for (path, content) in &files {
            let target = self.resolve(path)?;
            tokio::fs::write(&target, content.as_bytes())
                .await
                .map_err(|e| map_io(path, e))?;
        }

        debug!(files = files.len(), "Mounted tree into local sandbox");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let target = self.resolve(path)?;
        let bytes = tokio::fs::read(&target)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(FileContent::from_bytes(bytes))
    }

    async fn write_file(&self, path: &str, content: &FileContent) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(SandboxError::filesystem(path, "refusing to remove the sandbox root"));
        }

        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| map_io(path, e))?;
        let outcome = if metadata.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await
            } else {
                tokio::fs::remove_dir(&target).await
            }
        } else {
            tokio::fs::remove_file(&target).await
        };
        outcome.map_err(|e| map_io(path, e))
    }

    async fn snapshot(&self) -> Result<Files> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| SandboxError::filesystem("/", e))?
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle> {
        let command = command_line(program, args);
        let terminal = options.terminal.unwrap_or_default();

        let mut process = Command::new(program);
        process
            .args(args)
            .current_dir(&self.root)
            .env("COLUMNS", terminal.cols.to_string())
            .env("LINES", terminal.rows.to_string())
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group so a kill also reaches the processes the shell started
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process
            .spawn()
            .map_err(|e| {
                error!(command = %command, error = %e, "Failed to spawn process");
                SandboxError::SpawnFailed {
                    command: command.clone(),
                    reason: e.to_string(),
                }
            })?;
        debug!(command = %command, pid = ?child.id(), "Spawned process");

        let (handle, channels) = process_pair();
        let ProcessChannels {
            mut input,
            output,
            exit,
            mut resize,
            kill,
        } = channels;
        let ports = Arc::new(Mutex::new(BTreeSet::new()));
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(
                stdout,
                output.clone(),
                ports.clone(),
                self.port_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(
                stderr,
                output.clone(),
                ports.clone(),
                self.port_tx.clone(),
            )));
        }
        drop(output);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = input.recv().await {
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        let port_tx = self.port_tx.clone();
        tokio::spawn(async move {
            let mut killed = false;
            let code = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => status.code().unwrap_or(KILLED_EXIT_CODE),
                            Err(e) => {
                                error!(command = %command, error = %e, "Failed to wait for process");
                                1
                            }
                        };
                    }
                    _ = kill.cancelled() => {
                        kill_process_group(&mut child, &command).await;
                        killed = true;
                        break KILLED_EXIT_CODE;
                    }
                    Some(size) = resize.recv() => {
                        debug!(cols = size.cols, rows = size.rows, "Local processes have no pseudo-terminal to resize");
                    }
                }
            };

            for reader in readers {
                // A process that left the group may still hold the pipes open
                if killed {
                    reader.abort();
                }
                let _ = reader.await;
            }

            let opened: Vec<u16> = ports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect();
            for port in opened {
                let _ = port_tx.send(PortEvent::close(port, local_url(port)));
            }

            debug!(command = %command, code, "Process exited");
            let _ = exit.send(code);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PortEventKind;
    use pretty_assertions::assert_eq;
    use tutorbox_core::{files_from, to_file_tree};

    async fn boot() -> Arc<dyn Sandbox> {
        LocalProvider::without_watcher()
            .boot(&BootOptions::default())
            .await
            .unwrap()
    }

    fn sh(command: &str) -> Vec<String> {
        vec!["-c".to_string(), command.to_string()]
    }

    #[test]
    fn test_detect_port() {
        assert_eq!(detect_port("  Local:   http://localhost:5173/"), Some(5173));
        assert_eq!(detect_port("listening on http://127.0.0.1:3000"), Some(3000));
        assert_eq!(detect_port("ready at https://0.0.0.0:8443/app"), Some(8443));
        assert_eq!(detect_port("compiled successfully"), None);
    }

    #[test]
    fn test_sandbox_path() {
        let root = Path::new("/tmp/tutorbox-x/tutorial");
        assert_eq!(
            sandbox_path(root, Path::new("/tmp/tutorbox-x/tutorial/src/a.js")),
            Some("/src/a.js".to_string())
        );
        assert_eq!(sandbox_path(root, root), None);
        assert_eq!(sandbox_path(root, Path::new("/etc/passwd")), None);
    }

    #[tokio::test]
    async fn test_mount_read_and_snapshot() {
        let sandbox = boot().await;
        let files = files_from([
            ("/package.json", "{}"),
            ("/src/index.js", "console.log(1)"),
            ("/node_modules/dep/index.js", "ignored"),
        ]);
        sandbox.mount(&to_file_tree(&files)).await.unwrap();

        assert_eq!(
            sandbox.read_file("/src/index.js").await.unwrap(),
            "console.log(1)".into()
        );

        let snapshot = sandbox.snapshot().await.unwrap();
        assert_eq!(
            snapshot.keys().cloned().collect::<Vec<_>>(),
            vec!["/package.json".to_string(), "/src/index.js".to_string()]
        );
    }

    #[tokio::test]
    async fn test_binary_content_round_trips() {
        let sandbox = boot().await;
        let bytes = FileContent::Binary(vec![0xff, 0x00, 0xfe]);
        sandbox.write_file("/img/logo.png", &bytes).await.unwrap();
        assert_eq!(sandbox.read_file("/img/logo.png").await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_rm_and_missing_paths() {
        let sandbox = boot().await;
        sandbox.write_file("/dir/a.txt", &"a".into()).await.unwrap();

        assert!(sandbox.rm("/dir", false).await.is_err());
        sandbox.rm("/dir", true).await.unwrap();

        assert!(matches!(
            sandbox.read_file("/dir/a.txt").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            sandbox.rm("/missing", false).await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_parent_segments() {
        let sandbox = boot().await;
        assert!(matches!(
            sandbox.write_file("/../escape.txt", &"x".into()).await,
            Err(SandboxError::Filesystem { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_collects_output_before_exit() {
        let sandbox = boot().await;
        sandbox.write_file("/hello.txt", &"hi".into()).await.unwrap();

        let mut process = sandbox
            .spawn("sh", &sh("cat hello.txt; echo; exit 3"), SpawnOptions::default())
            .await
            .unwrap();

        let code = (&mut process.exit).await.unwrap();
        let mut output = String::new();
        while let Ok(chunk) = process.output.try_recv() {
            output.push_str(&chunk);
        }

        assert_eq!(code, 3);
        assert_eq!(output, "hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_ports() {
        let sandbox = boot().await;
        let mut ports = sandbox.subscribe_ports();

        let process = sandbox
            .spawn(
                "sh",
                &sh("echo 'Server running at http://localhost:4173/'"),
                SpawnOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(process.exit.await, Ok(0));

        let open = ports.recv().await.unwrap();
        assert_eq!((open.port, open.kind), (4173, PortEventKind::Open));
        let close = ports.recv().await.unwrap();
        assert_eq!((close.port, close.kind), (4173, PortEventKind::Close));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_long_running_process() {
        let sandbox = boot().await;
        let process = sandbox
            .spawn("sh", &sh("sleep 30"), SpawnOptions::default())
            .await
            .unwrap();

        process.kill();
        assert_eq!(process.exit.await, Ok(KILLED_EXIT_CODE));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reaches_shell_children() {
        let sandbox = boot().await;
        let process = sandbox
            .spawn("sh", &sh("sleep 4; echo done"), SpawnOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        process.kill();
        let code = tokio::time::timeout(Duration::from_secs(2), process.exit)
            .await
            .expect("exit should follow the kill");

        assert_eq!(code, Ok(KILLED_EXIT_CODE));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let sandbox = boot().await;
        let result = sandbox
            .spawn("definitely-not-a-program", &[], SpawnOptions::default())
            .await;
        assert!(matches!(result, Err(SandboxError::SpawnFailed { .. })));
    }
}
