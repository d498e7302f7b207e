// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Tutorbox

// Content Server
pub const TUTORBOX_CONTENT_URL: &str = "TUTORBOX_CONTENT_URL";

// Remote Files Fetcher
pub const TUTORBOX_FETCH_RETRY_ATTEMPTS: &str = "TUTORBOX_FETCH_RETRY_ATTEMPTS";
pub const TUTORBOX_FETCH_RETRY_DELAY_MS: &str = "TUTORBOX_FETCH_RETRY_DELAY_MS";

// Terminal Geometry
pub const TUTORBOX_TERMINAL_COLS: &str = "TUTORBOX_TERMINAL_COLS";
pub const TUTORBOX_TERMINAL_ROWS: &str = "TUTORBOX_TERMINAL_ROWS";

// Sandbox
pub const TUTORBOX_BOOT_POLICY: &str = "TUTORBOX_BOOT_POLICY";
pub const TUTORBOX_SHELL: &str = "TUTORBOX_SHELL";

// Logging
pub const TUTORBOX_LOG: &str = "TUTORBOX_LOG";
pub const RUST_LOG: &str = "RUST_LOG"; // Fallback

// Defaults
pub const DEFAULT_CONTENT_URL: &str = "http://localhost:4321/content";
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_TERMINAL_COLS: u16 = 80;
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;
pub const DEFAULT_SHELL: &str = "jsh";
