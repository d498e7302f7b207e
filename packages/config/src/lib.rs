// ABOUTME: Configuration package for the tutorial runtime
// ABOUTME: Exposes environment variable names and the validated RuntimeConfig

pub mod constants;
mod settings;

pub use settings::{BootPolicy, ConfigError, Result, RuntimeConfig};
