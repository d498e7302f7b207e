// ABOUTME: Sandbox abstraction for the tutorial runtime
// ABOUTME: Provider/Sandbox traits, the boot gate, and the memory and local providers

pub mod boot;
pub mod error;
pub mod providers;

pub use boot::{BootGate, BootStatus, HostProfile, MIN_SAFE_MEMORY_GB};
pub use error::{Result, SandboxError};
pub use providers::{
    command_line, process_pair, BootOptions, FsEvent, LocalProvider, LocalSandbox,
    MemoryProvider, MemorySandbox, PortEvent, PortEventKind, ProcessChannels, ProcessHandle,
    Provider, Sandbox, ScriptedProcess, SpawnOptions, SpawnRecord, TerminalSize,
    KILLED_EXIT_CODE,
};
