// ABOUTME: Preview tracker merging configured previews with sandbox port events
// ABOUTME: Publishes the preview list on a watch channel whenever it changes

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tutorbox_sandbox::{PortEvent, PortEventKind, Sandbox};

use crate::types::{PortInfo, PreviewInfo, PreviewSpec, PreviewState, SharedPortInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreviewMode {
    /// Preview every open port, in the order ports opened
    Auto,
    /// Show exactly these previews; empty disables previews
    Configured(Vec<PreviewSpec>),
}

#[derive(Debug)]
struct TrackerState {
    mode: PreviewMode,
    ports: HashMap<u16, SharedPortInfo>,
    /// Every preview instance handed out so far
    instances: Vec<PreviewInfo>,
    open_ports: Vec<u16>,
    published: Vec<PreviewState>,
}

impl TrackerState {
    fn port_info(&mut self, port: u16) -> SharedPortInfo {
        self.ports
            .entry(port)
            .or_insert_with(|| Arc::new(RwLock::new(PortInfo::new(port))))
            .clone()
    }

    fn preview(&mut self, port: u16, title: Option<&str>, pathname: Option<&str>) -> PreviewInfo {
        let candidate =
            PreviewInfo::new(self.port_info(port), title.map(str::to_string), pathname);
        if let Some(existing) = self.instances.iter().find(|p| **p == candidate) {
            return existing.clone();
        }
        self.instances.push(candidate.clone());
        candidate
    }

    fn visible(&mut self) -> Vec<PreviewInfo> {
        match self.mode.clone() {
            PreviewMode::Auto => self
                .open_ports
                .clone()
                .into_iter()
                .map(|port| self.preview(port, None, None))
                .collect(),
            PreviewMode::Configured(specs) => specs
                .iter()
                .map(|spec| {
                    self.preview(spec.port, spec.title.as_deref(), spec.pathname.as_deref())
                })
                .collect(),
        }
    }
}

/// Maps sandbox ports to previews.
pub struct PreviewTracker {
    state: Mutex<TrackerState>,
    previews: watch::Sender<Vec<PreviewInfo>>,
}

impl std::fmt::Debug for PreviewTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewTracker")
            .field("state", &self.state)
            .finish()
    }
}

impl Default for PreviewTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewTracker {
    pub fn new() -> Self {
        let (previews, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(TrackerState {
                mode: PreviewMode::Auto,
                ports: HashMap::new(),
                instances: Vec::new(),
                open_ports: Vec::new(),
                published: Vec::new(),
            }),
            previews,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the preview configuration. `None` selects automatic mode.
    pub fn set_config(&self, specs: Option<Vec<PreviewSpec>>) {
        let mode = match specs {
            None => PreviewMode::Auto,
            Some(specs) => PreviewMode::Configured(specs),
        };
        debug!(?mode, "Preview configuration updated");
        self.lock().mode = mode;
        self.publish();
    }

    /// Apply a port event from the sandbox.
    pub fn on_port_event(&self, event: &PortEvent) {
        {
            let mut state = self.lock();
            let info = state.port_info(event.port);
            {
                let mut info = info.write().unwrap_or_else(PoisonError::into_inner);
                match event.kind {
                    PortEventKind::Open => {
                        info.ready = true;
                        info.origin = Some(event.url.trim_end_matches('/').to_string());
                    }
                    PortEventKind::Close => {
                        info.ready = false;
                    }
                }
            }

            match event.kind {
                PortEventKind::Open => {
                    if !state.open_ports.contains(&event.port) {
                        state.open_ports.push(event.port);
                    }
                    state.preview(event.port, None, None);
                    info!(port = event.port, url = %event.url, "Port ready");
                }
                PortEventKind::Close => {
                    state.open_ports.retain(|port| *port != event.port);
                    info!(port = event.port, "Port closed");
                }
            }
        }
        self.publish();
    }

    /// Reuse or create the preview with this identity.
    pub fn find_or_create(
        &self,
        port: u16,
        title: Option<&str>,
        pathname: Option<&str>,
    ) -> PreviewInfo {
        self.lock().preview(port, title, pathname)
    }

    pub fn port_info(&self, port: u16) -> SharedPortInfo {
        self.lock().port_info(port)
    }

    /// Current preview list
    pub fn previews(&self) -> Vec<PreviewInfo> {
        self.previews.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PreviewInfo>> {
        self.previews.subscribe()
    }

    fn publish(&self) {
        let mut state = self.lock();
        let visible = state.visible();
        let snapshot: Vec<PreviewState> = visible.iter().map(PreviewInfo::state).collect();
        if snapshot != state.published {
            state.published = snapshot;
            self.previews.send_replace(visible);
        }
    }

    /// Follow the port events of `sandbox` until its event stream ends.
    pub fn attach(self: &Arc<Self>, sandbox: &dyn Sandbox) -> JoinHandle<()> {
        let mut events = sandbox.subscribe_ports();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracker.on_port_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Preview tracker missed port events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
