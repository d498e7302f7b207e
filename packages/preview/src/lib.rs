//! Tutorbox Preview - maps sandbox ports to user-facing previews
//!
//! The tracker merges the lesson's preview configuration with the port
//! events reported by the sandbox and publishes the resulting preview list.

pub mod tracker;
pub mod types;

pub use tracker::PreviewTracker;
pub use types::{
    PortInfo, PreviewError, PreviewInfo, PreviewResult, PreviewSchema, PreviewSpec,
    PreviewState, PreviewsSchema, SharedPortInfo,
};
