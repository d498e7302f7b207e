// ABOUTME: Tutorial runtime orchestrating file bundles, the sandbox, and the editor
// ABOUTME: Exposes the runner, the lesson session, and their observable stores

pub mod editor;
pub mod error;
pub mod fetcher;
pub mod output;
pub mod runner;
pub mod session;
pub mod steps;

pub use editor::{
    DocumentChange, DocumentKind, EditorDocument, EditorDocuments, EditorStore, ScrollPosition,
};
pub use error::{Result, RuntimeError};
pub use fetcher::{FilesFetcher, Invalidation};
pub use output::{OutputMultiplexer, TerminalSink, TranscriptSink};
pub use runner::{TutorialRunner, WatchFilter};
pub use session::{LessonDescriptor, TutorialSession};
pub use steps::StepsController;
