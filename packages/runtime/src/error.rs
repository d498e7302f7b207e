// ABOUTME: Error types for the tutorial runtime
// ABOUTME: Wraps sandbox, task, preview, and HTTP failures behind RuntimeError

use thiserror::Error;
use tutorbox_config::ConfigError;
use tutorbox_core::TaskError;
use tutorbox_preview::PreviewError;
use tutorbox_sandbox::SandboxError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Preview error: {0}")]
    Preview(#[from] PreviewError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid bundle '{id}': {reason}")]
    InvalidBundle { id: String, reason: String },

    #[error("Invalid watch pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("No lesson loaded")]
    NoLesson,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Produced by cancellation of superseded work
    pub fn is_aborted(&self) -> bool {
        matches!(self, RuntimeError::Task(TaskError::Aborted))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
