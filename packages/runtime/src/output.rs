// ABOUTME: Output multiplexer fanning sandbox process output out to terminal sinks
// ABOUTME: Also carries the terminal geometry used to size sandbox processes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tutorbox_sandbox::TerminalSize;

/// A terminal-like consumer of process output
pub trait TerminalSink: Send + Sync {
    fn write(&self, data: &str);

    /// Clear the terminal
    fn reset(&self);
}

pub struct OutputMultiplexer {
    sinks: RwLock<Vec<Arc<dyn TerminalSink>>>,
    geometry: watch::Sender<TerminalSize>,
}

impl std::fmt::Debug for OutputMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMultiplexer")
            .field("sinks", &self.sink_count())
            .field("geometry", &*self.geometry.borrow())
            .finish()
    }
}

impl Default for OutputMultiplexer {
    fn default() -> Self {
        Self::new(TerminalSize::default())
    }
}

impl OutputMultiplexer {
    pub fn new(geometry: TerminalSize) -> Self {
        let (geometry, _) = watch::channel(geometry);
        Self {
            sinks: RwLock::new(Vec::new()),
            geometry,
        }
    }

    pub fn register(&self, sink: Arc<dyn TerminalSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `data` to every sink, in registration order.
    pub fn write(&self, data: &str) {
        for sink in self.sinks.read().unwrap_or_else(PoisonError::into_inner).iter() {
            sink.write(data);
        }
    }

    pub fn reset(&self) {
        for sink in self.sinks.read().unwrap_or_else(PoisonError::into_inner).iter() {
            sink.reset();
        }
    }

    pub fn geometry(&self) -> TerminalSize {
        *self.geometry.borrow()
    }

    /// Publish new terminal geometry; running processes are resized.
    pub fn resize(&self, size: TerminalSize) {
        self.geometry.send_if_modified(|current| {
            if *current == size {
                false
            } else {
                *current = size;
                true
            }
        });
    }

    pub fn subscribe_geometry(&self) -> watch::Receiver<TerminalSize> {
        self.geometry.subscribe()
    }
}

/// Sink that keeps everything written since the last reset
#[derive(Debug, Default)]
pub struct TranscriptSink {
    buffer: Mutex<String>,
    resets: AtomicUsize,
}

impl TranscriptSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl TerminalSink for TranscriptSink {
    fn write(&self, data: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(data);
    }

    fn reset(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
