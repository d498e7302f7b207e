// ABOUTME: Remote files fetcher for template, lesson, and solution bundles
// ABOUTME: Caches bundles by id, dedups in-flight requests, and retries failed fetches

use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use tutorbox_config::RuntimeConfig;
use tutorbox_core::{
    new_task, new_task_or, normalize_path, BundleKind, FileContent, Files, FilesRef, Task,
    TaskError, TaskSlot,
};

use crate::error::{Result, RuntimeError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry of a bundle payload: plain text or base64-encoded bytes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BundleEntry {
    Text(String),
    Binary { base64: String },
}

/// Outcome of [`FilesFetcher::invalidate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// The bundle was never loaded, or the refetch was superseded
    None,
    Updated { kind: BundleKind, files: Files },
}

/// Outcome of one bundle download, retries included.
#[derive(Debug, Clone)]
enum Fetched {
    Bundle(Files),
    /// Every attempt failed; callers see an empty bundle, the cache stays untouched
    Unavailable,
    /// A newer template load took over
    Superseded,
}

#[derive(Debug, Clone)]
struct BundleClient {
    client: Client,
    base_url: String,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl BundleClient {
    fn url(&self, id: &str) -> String {
        format!("{}/{}.json", self.base_url, id)
    }

    /// Fetch a bundle, retrying failures.
    async fn fetch(&self, id: &str) -> Fetched {
        for attempt in 1..=self.retry_attempts {
            match self.fetch_once(id).await {
                Ok(files) => {
                    debug!(bundle = id, files = files.len(), attempt, "Fetched bundle");
                    return Fetched::Bundle(files);
                }
                Err(e) => {
                    debug!(bundle = id, attempt, error = %e, "Bundle fetch attempt failed");
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        warn!(
            bundle = id,
            attempts = self.retry_attempts,
            "Giving up on bundle fetch, continuing with empty content"
        );
        Fetched::Unavailable
    }

    async fn fetch_once(&self, id: &str) -> Result<Files> {
        let entries: HashMap<String, BundleEntry> = self
            .client
            .get(self.url(id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        entries
            .into_iter()
            .map(|(path, entry)| {
                let content = match entry {
                    BundleEntry::Text(text) => FileContent::Text(text),
                    BundleEntry::Binary { base64 } => FileContent::Binary(
                        base64::engine::general_purpose::STANDARD
                            .decode(base64.as_bytes())
                            .map_err(|e| RuntimeError::InvalidBundle {
                                id: id.to_string(),
                                reason: format!("{}: {}", path, e),
                            })?,
                    ),
                };
                Ok((normalize_path(&path), content))
            })
            .collect()
    }
}

/// Fetches and caches file bundles from the content server.
#[derive(Debug)]
pub struct FilesFetcher {
    bundles: BundleClient,
    cache: Mutex<HashMap<String, Files>>,
    in_flight: Mutex<HashMap<String, Task<Fetched>>>,
    template: TaskSlot<Fetched>,
    /// Id of the template the load in `template` is for
    loading_template: Mutex<Option<String>>,
    current_template: Mutex<Option<String>>,
}

impl FilesFetcher {
    pub fn new(base_url: &str, retry_attempts: u32, retry_delay: Duration) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            bundles: BundleClient {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                retry_attempts: retry_attempts.max(1),
                retry_delay,
            },
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            template: TaskSlot::new(),
            loading_template: Mutex::new(None),
            current_template: Mutex::new(None),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Self::new(
            &config.content_url,
            config.retry_attempts,
            config.retry_delay,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.bundles.base_url
    }

    fn cached(&self, id: &str) -> Option<Files> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn store(&self, id: &str, files: &Files) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), files.clone());
    }

    /// Load a template. Only the most recent template matters: requesting a
    /// different one cancels the load in flight, whose callers get an abort.
    /// Requests for the template already loading join that load.
    pub async fn get_template(&self, template: &FilesRef) -> Result<Files> {
        self.set_current_template(template.id());
        if let Some(files) = self.cached(template.id()) {
            return Ok(files);
        }

        match self.load_template(template, false).await {
            Some(files) => Ok(files),
            None => Err(TaskError::Aborted.into()),
        }
    }

    /// Load lesson files. An empty ref resolves to no files without a request.
    pub async fn get_lesson_files(&self, files: &FilesRef) -> Result<Files> {
        self.get_bundle(files).await
    }

    /// Load a lesson solution. An empty ref resolves to no files without a request.
    pub async fn get_lesson_solution(&self, solution: &FilesRef) -> Result<Files> {
        self.get_bundle(solution).await
    }

    /// Load any bundle by id, whatever its kind.
    pub async fn fetch_bundle(&self, id: &str) -> Result<Files> {
        match self.cached(id) {
            Some(files) => Ok(files),
            None => self.fetch_shared(id).await,
        }
    }

    /// Drop a cached bundle and fetch it again.
    pub async fn invalidate(&self, bundle: &FilesRef) -> Result<Invalidation> {
        let was_cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(bundle.id())
            .is_some();
        if !was_cached {
            debug!(bundle = bundle.id(), "Ignoring invalidation of a bundle never loaded");
            return Ok(Invalidation::None);
        }

        info!(bundle = bundle.id(), "Refetching invalidated bundle");
        let is_current_template = self
            .current_template
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(bundle.id());

        let files = if is_current_template {
            match self.load_template(bundle, true).await {
                Some(files) => files,
                None => return Ok(Invalidation::None),
            }
        } else {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(bundle.id());
            self.fetch_shared(bundle.id()).await?
        };

        Ok(Invalidation::Updated {
            kind: bundle.kind(),
            files,
        })
    }

    fn set_current_template(&self, id: &str) {
        *self
            .current_template
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
    }

    /// Load `template` in the template slot, joining a load of the same
    /// template unless `fresh` is set. Cancellation resolves to `None`.
    async fn load_template(&self, template: &FilesRef, fresh: bool) -> Option<Files> {
        let task = {
            let mut loading = self
                .loading_template
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let pending = self
                .template
                .current()
                .filter(|task| !task.is_cancelled())
                .filter(|_| loading.as_deref() == Some(template.id()));

            match pending {
                Some(task) if !fresh => {
                    debug!(bundle = template.id(), "Joining template load in flight");
                    task
                }
                _ => {
                    let bundles = self.bundles.clone();
                    let id = template.id().to_string();
                    *loading = Some(id.clone());
                    self.template
                        .replace(new_task_or(Fetched::Superseded, move |_token| async move {
                            Ok(bundles.fetch(&id).await)
                        }))
                }
            }
        };

        let outcome = task.result().await;
        self.template.clear_if_current(&task);
        match outcome {
            Ok(Fetched::Bundle(files)) => {
                self.store(template.id(), &files);
                Some(files)
            }
            Ok(Fetched::Unavailable) => Some(Files::new()),
            Ok(Fetched::Superseded) | Err(_) => {
                debug!(bundle = template.id(), "Template load superseded");
                None
            }
        }
    }

    async fn get_bundle(&self, bundle: &FilesRef) -> Result<Files> {
        if bundle.is_empty() {
            return Ok(Files::new());
        }
        if let Some(files) = self.cached(bundle.id()) {
            return Ok(files);
        }
        self.fetch_shared(bundle.id()).await
    }

    /// Fetch `id`, joining a request already in flight for it.
    async fn fetch_shared(&self, id: &str) -> Result<Files> {
        let task = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight
                .entry(id.to_string())
                .or_insert_with(|| {
                    let bundles = self.bundles.clone();
                    let id = id.to_string();
                    new_task(move |_token| async move { Ok(bundles.fetch(&id).await) })
                })
                .clone()
        };

        let outcome = task.result().await;

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(id).is_some_and(|t| t.same_task(&task)) {
                in_flight.remove(id);
            }
        }

        match outcome? {
            Fetched::Bundle(files) => {
                self.store(id, &files);
                Ok(files)
            }
            Fetched::Unavailable => Ok(Files::new()),
            Fetched::Superseded => Err(TaskError::Aborted.into()),
        }
    }
}
