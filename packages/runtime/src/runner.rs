// ABOUTME: Tutorial runner coordinating file mounts, the command pipeline, and reconciliation
// ABOUTME: Keeps the sandbox filesystem and the editor store in sync in both directions

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tutorbox_config::RuntimeConfig;
use tutorbox_core::{
    diff_files, merge_files, new_task, normalize_path, to_file_tree, Command, Commands,
    CommandsSchema, FileContent, Files, FilesDiff, StepStatus, TaskError, TaskSlot,
};
use tutorbox_sandbox::{BootGate, Sandbox, SandboxError, SpawnOptions, TerminalSize};

use crate::editor::EditorStore;
use crate::error::{Result, RuntimeError};
use crate::output::OutputMultiplexer;
use crate::steps::StepsController;

/// Limits which sandbox paths are reconciled into the editor.
/// Dependency folders are never reconciled.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    include: Option<GlobSet>,
}

impl WatchFilter {
    /// Every path except dependency folders
    pub fn all() -> Self {
        Self::default()
    }

    /// Only paths matching one of `patterns` (e.g. `src/**/*.js`). No
    /// patterns means every path.
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::all());
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern.trim_start_matches('/'))
                .literal_separator(true)
                .build()
                .map_err(|e| RuntimeError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| RuntimeError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self { include: Some(set) })
    }

    pub fn matches(&self, path: &str) -> bool {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "node_modules") {
            return false;
        }
        self.include
            .as_ref()
            .map_or(true, |set| set.is_match(relative))
    }
}

/// State shared with the runner's background tasks
#[derive(Clone)]
struct Shared {
    gate: Arc<BootGate>,
    editor: Arc<EditorStore>,
    output: Arc<OutputMultiplexer>,
    steps: Arc<StepsController>,
    shell: Arc<str>,
    /// Last known sandbox content, excluding dependency folders
    known: Arc<tokio::sync::Mutex<Files>>,
    filter: Arc<RwLock<WatchFilter>>,
    prepare: Arc<TaskSlot<()>>,
    reconciler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Shared {
    async fn sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        let sandbox = self.gate.request_boot().await?;
        self.ensure_reconciler(&sandbox);
        Ok(sandbox)
    }

    fn ensure_reconciler(&self, sandbox: &Arc<dyn Sandbox>) {
        let mut reconciler = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner);
        if reconciler.is_some() {
            return;
        }

        let mut events = sandbox.subscribe_fs();
        let sandbox = sandbox.clone();
        let shared = self.clone();
        *reconciler = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                // One snapshot covers every event queued so far
                loop {
                    match events.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                if let Err(e) = shared.reconcile(sandbox.as_ref()).await {
                    warn!(error = %e, "Failed to reconcile sandbox changes");
                }
            }
            debug!("Sandbox filesystem events ended");
        }));
    }

    /// Diff the sandbox against the last known snapshot and apply the
    /// difference to the editor.
    async fn reconcile(&self, sandbox: &dyn Sandbox) -> Result<FilesDiff> {
        let diff = {
            let mut known = self.known.lock().await;
            let snapshot = sandbox.snapshot().await?;
            let diff = diff_files(&known, &snapshot);
            *known = snapshot;
            diff
        };
        if diff.is_empty() {
            return Ok(diff);
        }

        let filter = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (path, content) in &diff.added_or_modified {
            if filter.matches(path) {
                self.editor.update_file(path, content.clone());
            }
        }
        for path in &diff.removed {
            if filter.matches(path) {
                self.editor.delete_file(path);
            }
        }

        debug!(
            changed = diff.added_or_modified.len(),
            removed = diff.removed.len(),
            "Reconciled sandbox changes into the editor"
        );
        Ok(diff)
    }

    async fn mount_files(&self, files: Files, template: Files) -> Result<()> {
        let merged = merge_files(&template, &files);
        let sandbox = self.sandbox().await?;

        let mut known = self.known.lock().await;
        let diff = diff_files(&known, &merged);
        if diff.is_empty() {
            debug!(files = merged.len(), "Files unchanged, skipping mount");
            return Ok(());
        }
        *known = merged.clone();

        for path in &diff.removed {
            remove_quietly(sandbox.as_ref(), path, false).await?;
        }
        sandbox.mount(&to_file_tree(&merged)).await?;

        info!(
            files = merged.len(),
            changed = diff.added_or_modified.len(),
            removed = diff.removed.len(),
            "Mounted files into the sandbox"
        );
        Ok(())
    }

    /// Wait for the latest file preparation, following replacements.
    async fn wait_for_prepare(&self) -> std::result::Result<(), TaskError> {
        while let Some(prepare) = self.prepare.current() {
            match prepare.result().await {
                Err(TaskError::Aborted)
                    if self
                        .prepare
                        .current()
                        .is_some_and(|current| !current.same_task(&prepare)) =>
                {
                    continue;
                }
                outcome => return outcome,
            }
        }
        Ok(())
    }

    async fn run_pipeline(&self, commands: &Commands) -> Result<()> {
        let sandbox = self.sandbox().await?;
        self.steps.set_from_commands(commands);

        for (index, command) in commands.iter().enumerate() {
            if !command.is_runnable() {
                self.steps.set_status(index, StepStatus::Completed);
                continue;
            }

            info!(step = index, command = %command.shell_command, "Running command");
            self.steps.set_status(index, StepStatus::Running);

            match self.run_command(sandbox.as_ref(), command).await {
                Ok(Some(0)) => {
                    self.steps.set_status(index, StepStatus::Completed);
                }
                Ok(code) => {
                    warn!(step = index, command = %command.shell_command, code = ?code, "Command failed");
                    self.steps.set_status(index, StepStatus::Failed);
                    self.steps.skip_remaining(index + 1);
                    return Ok(());
                }
                Err(e) => {
                    error!(step = index, command = %command.shell_command, error = %e, "Command could not run");
                    self.steps.set_status(index, StepStatus::Failed);
                    self.steps.skip_remaining(index + 1);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Run one command to completion. `None` means the process vanished
    /// without reporting an exit code.
    async fn run_command(&self, sandbox: &dyn Sandbox, command: &Command) -> Result<Option<i32>> {
        let args = vec!["-c".to_string(), command.shell_command.clone()];
        let options = SpawnOptions {
            terminal: Some(self.output.geometry()),
            ..Default::default()
        };
        let mut process = sandbox.spawn(&self.shell, &args, options).await?;
        let _kill_on_drop = process.kill_token().drop_guard();

        let mut geometry = self.output.subscribe_geometry();
        geometry.borrow_and_update();
        let mut output_open = true;

        let code = loop {
            tokio::select! {
                biased;
                chunk = process.output.recv(), if output_open => match chunk {
                    Some(chunk) => self.output.write(&chunk),
                    None => output_open = false,
                },
                exit = &mut process.exit => {
                    while let Ok(chunk) = process.output.try_recv() {
                        self.output.write(&chunk);
                    }
                    break exit.ok();
                }
                Ok(()) = geometry.changed() => {
                    let size = *geometry.borrow_and_update();
                    let _ = process.resize.send(size);
                }
            }
        };

        debug!(command = %command.shell_command, code = ?code, "Command exited");
        Ok(code)
    }
}

async fn remove_quietly(sandbox: &dyn Sandbox, path: &str, recursive: bool) -> Result<()> {
    match sandbox.rm(path, recursive).await {
        Ok(()) | Err(SandboxError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

struct RunnerInner {
    shared: Shared,
    commands: Mutex<Commands>,
    run: TaskSlot<()>,
}

impl Drop for RunnerInner {
    fn drop(&mut self) {
        self.run.cancel();
        self.shared.prepare.cancel();
        if let Some(handle) = self
            .shared
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Coordinates one sandbox, its editor store, output, and step list.
#[derive(Clone)]
pub struct TutorialRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for TutorialRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorialRunner")
            .field("shell", &self.inner.shared.shell)
            .field("gate", &self.inner.shared.gate)
            .finish()
    }
}

impl TutorialRunner {
    pub fn new(gate: Arc<BootGate>, shell: &str, geometry: TerminalSize) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                shared: Shared {
                    gate,
                    editor: Arc::new(EditorStore::new()),
                    output: Arc::new(OutputMultiplexer::new(geometry)),
                    steps: Arc::new(StepsController::new()),
                    shell: Arc::from(shell),
                    known: Arc::new(tokio::sync::Mutex::new(Files::new())),
                    filter: Arc::new(RwLock::new(WatchFilter::all())),
                    prepare: Arc::new(TaskSlot::new()),
                    reconciler: Arc::new(Mutex::new(None)),
                },
                commands: Mutex::new(Commands::default()),
                run: TaskSlot::new(),
            }),
        }
    }

    pub fn from_config(gate: Arc<BootGate>, config: &RuntimeConfig) -> Self {
        Self::new(
            gate,
            &config.shell,
            TerminalSize::new(config.terminal_cols, config.terminal_rows),
        )
    }

    pub fn gate(&self) -> &Arc<BootGate> {
        &self.inner.shared.gate
    }

    pub fn editor(&self) -> &Arc<EditorStore> {
        &self.inner.shared.editor
    }

    pub fn output(&self) -> &Arc<OutputMultiplexer> {
        &self.inner.shared.output
    }

    pub fn steps(&self) -> &Arc<StepsController> {
        &self.inner.shared.steps
    }

    /// Boot the sandbox (waiting for the boot gate) and start reconciling its
    /// filesystem changes.
    pub async fn sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        self.inner.shared.sandbox().await
    }

    /// Normalize `schema` and derive the step list right away.
    pub fn set_commands(&self, schema: &CommandsSchema) {
        let commands = Commands::from(schema);
        self.inner.shared.steps.set_from_commands(&commands);
        *self
            .inner
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = commands;
    }

    pub fn commands(&self) -> Commands {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_watch_patterns(&self, patterns: &[String]) -> Result<()> {
        let filter = WatchFilter::new(patterns)?;
        *self
            .inner
            .shared
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = filter;
        Ok(())
    }

    /// Merge `template` and `files` (lesson files win), then mount the result.
    ///
    /// The preparation is registered before this returns, so a later
    /// [`run_commands`](Self::run_commands) waits for it even if the returned
    /// future is never polled.
    pub fn prepare_files(
        &self,
        files: Files,
        template: Files,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let shared = self.inner.shared.clone();
        let task = self.inner.shared.prepare.replace(new_task(move |_token| async move {
            shared.mount_files(files, template).await.map_err(|e| {
                error!(error = %e, "Failed to prepare files");
                TaskError::failed(e)
            })
        }));

        async move { task.result().await.map_err(RuntimeError::from) }
    }

    /// Run the command pipeline after pending file preparation has mounted.
    /// A previous run is cancelled and its process killed.
    pub fn run_commands(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let shared = self.inner.shared.clone();
        let commands = self.commands();
        let task = self.inner.run.replace(new_task(move |_token| async move {
            shared.wait_for_prepare().await?;
            shared
                .run_pipeline(&commands)
                .await
                .map_err(TaskError::failed)
        }));

        async move { task.result().await.map_err(RuntimeError::from) }
    }

    /// Stop the running pipeline, killing its current process.
    pub fn cancel_run(&self) {
        self.inner.run.cancel();
    }

    /// Wait for the most recent pipeline run, if any.
    pub async fn wait_for_commands(&self) -> Result<()> {
        match self.inner.run.current() {
            Some(run) => run.result().await.map_err(RuntimeError::from),
            None => Ok(()),
        }
    }

    /// Write one file from the editor into the sandbox.
    pub async fn update_file(&self, path: &str, content: FileContent) -> Result<()> {
        let shared = &self.inner.shared;
        let sandbox = shared.sandbox().await?;
        let path = normalize_path(path);

        let mut known = shared.known.lock().await;
        sandbox.write_file(&path, &content).await?;
        known.insert(path, content);
        Ok(())
    }

    /// Apply the difference between two editor file sets to the sandbox.
    pub async fn update_files(&self, previous: &Files, next: &Files) -> Result<()> {
        let diff = diff_files(previous, next);
        if diff.is_empty() {
            return Ok(());
        }

        let shared = &self.inner.shared;
        let sandbox = shared.sandbox().await?;
        let mut known = shared.known.lock().await;
        for path in &diff.removed {
            remove_quietly(sandbox.as_ref(), path, false).await?;
            known.remove(path);
        }
        for (path, content) in diff.added_or_modified {
            sandbox.write_file(&path, &content).await?;
            known.insert(path, content);
        }
        Ok(())
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let sandbox = self.inner.shared.sandbox().await?;
        sandbox.mkdir(&normalize_path(path)).await?;
        Ok(())
    }

    /// Remove a file or folder (recursively) from the sandbox.
    pub async fn delete_path(&self, path: &str) -> Result<()> {
        let shared = &self.inner.shared;
        let sandbox = shared.sandbox().await?;
        let path = normalize_path(path);
        let prefix = format!("{}/", path);

        let mut known = shared.known.lock().await;
        remove_quietly(sandbox.as_ref(), &path, true).await?;
        known.retain(|candidate, _| *candidate != path && !candidate.starts_with(&prefix));
        Ok(())
    }

    /// Current sandbox content, excluding dependency folders.
    pub async fn take_snapshot(&self) -> Result<Files> {
        let sandbox = self.inner.shared.sandbox().await?;
        Ok(sandbox.snapshot().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_filter_all_skips_dependencies() {
        let filter = WatchFilter::all();
        assert!(filter.matches("/src/index.js"));
        assert!(filter.matches("/package.json"));
        assert!(!filter.matches("/node_modules/react/index.js"));
    }

    #[test]
    fn test_watch_filter_patterns() {
        let filter =
            WatchFilter::new(&["src/**/*.js".to_string(), "/*.json".to_string()]).unwrap();
        assert!(filter.matches("/src/index.js"));
        assert!(filter.matches("/src/lib/util.js"));
        assert!(filter.matches("/package.json"));
        assert!(!filter.matches("/config/app.json"));
        assert!(!filter.matches("/src/style.css"));
        assert!(!filter.matches("/src/node_modules/x.js"));
    }

    #[test]
    fn test_watch_filter_rejects_bad_patterns() {
        assert!(matches!(
            WatchFilter::new(&["src/[".to_string()]),
            Err(RuntimeError::InvalidPattern { .. })
        ));
    }
}
