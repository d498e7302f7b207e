// ABOUTME: Core types and primitives for the tutorial runtime
// ABOUTME: Foundational package providing files, commands, steps, and cancellable tasks

pub mod commands;
pub mod files;
pub mod task;

// Re-export main types
pub use commands::{Command, CommandSchema, Commands, CommandsSchema, Step, StepStatus};
pub use files::{
    diff_files, files_from, flatten_tree, merge_files, normalize_path, to_file_tree, BundleKind,
    FileContent, FileSystemNode, FileSystemTree, Files, FilesDiff, FilesRef,
};
pub use task::{new_task, new_task_or, Task, TaskError, TaskResult, TaskSlot};
