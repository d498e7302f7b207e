// ABOUTME: Tutorial session loading lesson descriptors into a runner
// ABOUTME: Handles lesson switching, solve/reset, and hot reload of invalidated bundles

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tutorbox_config::RuntimeConfig;
use tutorbox_core::{new_task, CommandsSchema, Files, FilesRef, TaskError, TaskSlot};
use tutorbox_preview::{PreviewTracker, PreviewsSchema};
use tutorbox_sandbox::{BootGate, HostProfile, Provider};

use crate::editor::EditorStore;
use crate::error::{Result, RuntimeError};
use crate::fetcher::{FilesFetcher, Invalidation};
use crate::runner::TutorialRunner;
use crate::steps::StepsController;

fn default_template() -> String {
    "default".to_string()
}

/// Lesson metadata as served next to the lesson content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonDescriptor {
    pub id: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FilesRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<FilesRef>,
    #[serde(flatten)]
    pub commands: CommandsSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previews: Option<PreviewsSchema>,
    /// File selected in the editor once the lesson loads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    /// Glob patterns of sandbox paths reflected back into the editor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<Vec<String>>,
}

impl LessonDescriptor {
    pub fn template_ref(&self) -> FilesRef {
        FilesRef::template(&self.template)
    }

    pub fn files_ref(&self) -> FilesRef {
        self.files
            .clone()
            .unwrap_or_else(|| FilesRef::new(format!("{}-files", self.id), Vec::new()))
    }

    pub fn solution_ref(&self) -> FilesRef {
        self.solution
            .clone()
            .unwrap_or_else(|| FilesRef::new(format!("{}-solution", self.id), Vec::new()))
    }
}

#[derive(Debug, Clone)]
struct LoadedLesson {
    descriptor: LessonDescriptor,
    files: Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleRole {
    Template,
    Files,
    Solution,
}

#[derive(Clone)]
struct SessionContext {
    fetcher: Arc<FilesFetcher>,
    runner: TutorialRunner,
    previews: Arc<PreviewTracker>,
    lesson: Arc<Mutex<Option<LoadedLesson>>>,
    preview_events: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionContext {
    async fn load(&self, lesson: LessonDescriptor) -> Result<()> {
        info!(lesson = %lesson.id, template = %lesson.template, "Loading lesson");
        let files_ref = lesson.files_ref();
        let editor = self.runner.editor();

        editor.set_loading(files_ref.paths());
        self.runner.set_commands(&lesson.commands);
        let previews = match &lesson.previews {
            Some(schema) => schema.resolve()?,
            None => None,
        };
        self.previews.set_config(previews);
        self.runner
            .set_watch_patterns(lesson.watch.as_deref().unwrap_or_default())?;

        let template_ref = lesson.template_ref();
        let (template, files) = tokio::try_join!(
            self.fetcher.get_template(&template_ref),
            self.fetcher.get_lesson_files(&files_ref)
        )?;

        editor.set_documents(&files);
        let focus = lesson
            .focus
            .clone()
            .or_else(|| files.keys().next().cloned());
        editor.select_file(focus.as_deref());

        self.runner.prepare_files(files.clone(), template).await?;
        self.follow_ports().await?;

        *self.lesson.lock().unwrap_or_else(PoisonError::into_inner) = Some(LoadedLesson {
            descriptor: lesson,
            files,
        });

        // The pipeline runs on its own; callers observe it through the steps
        let _pipeline = self.runner.run_commands();
        Ok(())
    }

    async fn follow_ports(&self) -> Result<()> {
        let sandbox = self.runner.sandbox().await?;
        let mut preview_events = self
            .preview_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if preview_events.is_none() {
            *preview_events = Some(self.previews.attach(sandbox.as_ref()));
        }
        Ok(())
    }
}

/// Loads lessons into one runner and keeps them there.
pub struct TutorialSession {
    context: SessionContext,
    load: TaskSlot<()>,
}

impl std::fmt::Debug for TutorialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorialSession")
            .field("runner", &self.context.runner)
            .field("lesson", &self.lesson().map(|l| l.id))
            .finish()
    }
}

impl Drop for TutorialSession {
    fn drop(&mut self) {
        self.load.cancel();
        if let Some(handle) = self
            .context
            .preview_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl TutorialSession {
    pub fn new(fetcher: FilesFetcher, runner: TutorialRunner) -> Self {
        Self {
            context: SessionContext {
                fetcher: Arc::new(fetcher),
                runner,
                previews: Arc::new(PreviewTracker::new()),
                lesson: Arc::new(Mutex::new(None)),
                preview_events: Arc::new(Mutex::new(None)),
            },
            load: TaskSlot::new(),
        }
    }

    /// Session over `provider`, configured from `config`.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        config: &RuntimeConfig,
        profile: HostProfile,
    ) -> Result<Self> {
        let gate = Arc::new(BootGate::new(provider, config.boot_policy, profile));
        let fetcher = FilesFetcher::from_config(config)?;
        Ok(Self::new(fetcher, TutorialRunner::from_config(gate, config)))
    }

    pub fn runner(&self) -> &TutorialRunner {
        &self.context.runner
    }

    pub fn editor(&self) -> &Arc<EditorStore> {
        self.context.runner.editor()
    }

    pub fn steps(&self) -> &Arc<StepsController> {
        self.context.runner.steps()
    }

    pub fn previews(&self) -> &Arc<PreviewTracker> {
        &self.context.previews
    }

    pub fn gate(&self) -> &Arc<BootGate> {
        self.context.runner.gate()
    }

    pub fn fetcher(&self) -> &Arc<FilesFetcher> {
        &self.context.fetcher
    }

    /// Descriptor of the loaded lesson
    pub fn lesson(&self) -> Option<LessonDescriptor> {
        self.loaded().map(|lesson| lesson.descriptor)
    }

    fn loaded(&self) -> Option<LoadedLesson> {
        self.context
            .lesson
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_lesson(&self) -> Result<LoadedLesson> {
        self.loaded().ok_or(RuntimeError::NoLesson)
    }

    /// Load `lesson` and start its commands. A load still in progress is
    /// cancelled and resolves to an abort.
    pub async fn load_lesson(&self, lesson: LessonDescriptor) -> Result<()> {
        let context = self.context.clone();
        let task = self.load.replace(new_task(move |_token| async move {
            context.load(lesson).await.map_err(|e| match e {
                RuntimeError::Task(TaskError::Aborted) => TaskError::Aborted,
                other => TaskError::failed(other),
            })
        }));

        let outcome = task.result().await;
        self.load.clear_if_current(&task);
        if let Err(TaskError::Aborted) = outcome {
            debug!("Lesson load superseded");
        }
        Ok(outcome?)
    }

    /// Replace the editor content with the lesson solution.
    pub async fn solve(&self) -> Result<()> {
        let lesson = self.require_lesson()?;
        let solution = self
            .context
            .fetcher
            .get_lesson_solution(&lesson.descriptor.solution_ref())
            .await?;
        info!(lesson = %lesson.descriptor.id, files = solution.len(), "Applying solution");
        self.show_files(&solution).await
    }

    /// Restore the lesson's original files.
    pub async fn reset(&self) -> Result<()> {
        let lesson = self.require_lesson()?;
        info!(lesson = %lesson.descriptor.id, "Resetting lesson files");
        self.show_files(&lesson.files).await
    }

    async fn show_files(&self, files: &Files) -> Result<()> {
        let editor = self.editor();
        let previous = editor.files();
        editor.set_documents(files);
        self.context.runner.update_files(&previous, files).await
    }

    /// Refetch the bundle `bundle_id` if the loaded lesson uses it and apply
    /// the new content. Returns whether anything was applied.
    pub async fn hot_reload(&self, bundle_id: &str) -> Result<bool> {
        let Some(lesson) = self.loaded() else {
            return Ok(false);
        };
        let descriptor = &lesson.descriptor;

        let (role, bundle) = if descriptor.template_ref().id() == bundle_id {
            (BundleRole::Template, descriptor.template_ref())
        } else if descriptor.files_ref().id() == bundle_id {
            (BundleRole::Files, descriptor.files_ref())
        } else if descriptor.solution_ref().id() == bundle_id {
            (BundleRole::Solution, descriptor.solution_ref())
        } else {
            debug!(bundle = bundle_id, "Ignoring reload of a bundle the lesson does not use");
            return Ok(false);
        };

        let files = match self.context.fetcher.invalidate(&bundle).await? {
            Invalidation::None => return Ok(false),
            Invalidation::Updated { files, .. } => files,
        };
        info!(bundle = bundle_id, ?role, files = files.len(), "Applying reloaded bundle");

        match role {
            BundleRole::Template => {
                let edited = self.editor().files();
                self.context.runner.prepare_files(edited, files).await?;
            }
            BundleRole::Files => {
                let template = self
                    .context
                    .fetcher
                    .get_template(&descriptor.template_ref())
                    .await?;
                self.editor().set_documents(&files);
                if let Some(loaded) = self
                    .context
                    .lesson
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_mut()
                {
                    loaded.files = files.clone();
                }
                self.context.runner.prepare_files(files, template).await?;
            }
            // The refreshed solution is picked up by the next solve()
            BundleRole::Solution => {}
        }
        Ok(true)
    }
}
