// ABOUTME: Runtime configuration loaded from environment variables
// ABOUTME: Validates content server, retry, terminal geometry, boot policy, and shell settings

use std::env;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::*;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid number for {key}: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("Invalid boot policy: {0} (expected auto, blocked or unblocked)")]
    InvalidBootPolicy(String),
    #[error("Invalid content URL: {0}")]
    InvalidContentUrl(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// How the boot gate decides whether the sandbox may start immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPolicy {
    /// Use the host heuristic
    Auto,
    /// Start blocked until someone calls `unblock()`
    Blocked,
    /// Never block
    Unblocked,
}

impl FromStr for BootPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(BootPolicy::Auto),
            "blocked" => Ok(BootPolicy::Blocked),
            "unblocked" => Ok(BootPolicy::Unblocked),
            _ => Err(ConfigError::InvalidBootPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub content_url: String,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    pub boot_policy: BootPolicy,
    pub shell: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            content_url: DEFAULT_CONTENT_URL.to_string(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            terminal_cols: DEFAULT_TERMINAL_COLS,
            terminal_rows: DEFAULT_TERMINAL_ROWS,
            boot_policy: BootPolicy::Auto,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let content_url = match lookup(TUTORBOX_CONTENT_URL) {
            Some(url) => {
                let url = url.trim().trim_end_matches('/').to_string();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidContentUrl(url));
                }
                url
            }
            None => defaults.content_url,
        };

        let retry_attempts = parse_ranged(
            &lookup,
            TUTORBOX_FETCH_RETRY_ATTEMPTS,
            DEFAULT_RETRY_ATTEMPTS as u64,
            1,
            10,
        )? as u32;

        let retry_delay_ms = parse_ranged(
            &lookup,
            TUTORBOX_FETCH_RETRY_DELAY_MS,
            DEFAULT_RETRY_DELAY_MS,
            0,
            60_000,
        )?;

        let terminal_cols = parse_ranged(
            &lookup,
            TUTORBOX_TERMINAL_COLS,
            DEFAULT_TERMINAL_COLS as u64,
            1,
            u16::MAX as u64,
        )? as u16;

        let terminal_rows = parse_ranged(
            &lookup,
            TUTORBOX_TERMINAL_ROWS,
            DEFAULT_TERMINAL_ROWS as u64,
            1,
            u16::MAX as u64,
        )? as u16;

        let boot_policy = match lookup(TUTORBOX_BOOT_POLICY) {
            Some(value) => value.parse::<BootPolicy>()?,
            None => defaults.boot_policy,
        };

        let shell = lookup(TUTORBOX_SHELL)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.shell);

        let config = RuntimeConfig {
            content_url,
            retry_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            terminal_cols,
            terminal_rows,
            boot_policy,
            shell,
        };
        debug!(?config, "Loaded runtime configuration");
        Ok(config)
    }
}

fn parse_ranged<F>(lookup: &F, key: &'static str, default: u64, min: u64, max: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber { key, source })?;

    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }

    Ok(value)
}
