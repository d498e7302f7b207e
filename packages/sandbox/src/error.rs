// ABOUTME: Error types for sandbox operations
// ABOUTME: Covers boot, filesystem, process spawn, and watcher failures

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Provider failed to boot a sandbox
    #[error("Sandbox boot failed: {0}")]
    BootFailed(String),

    /// Boot gate went away while a boot request was waiting
    #[error("Boot gate closed before the sandbox was unblocked")]
    GateClosed,

    /// Path does not exist in the sandbox filesystem
    #[error("Path not found in sandbox: {0}")]
    NotFound(String),

    /// Filesystem operation failed
    #[error("Filesystem error at {path}: {reason}")]
    Filesystem { path: String, reason: String },

    /// Process could not be started
    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// Filesystem watcher could not be set up
    #[error("Watcher error: {0}")]
    Watch(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn filesystem(path: impl Into<String>, reason: impl ToString) -> Self {
        SandboxError::Filesystem {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
