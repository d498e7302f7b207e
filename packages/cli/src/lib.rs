// ABOUTME: Library half of the tutorbox CLI
// ABOUTME: Logging setup and terminal rendering shared by the binary's subcommands

pub mod logging;
pub mod terminal;
