// ABOUTME: Tracing subscriber setup for the tutorbox binary
// ABOUTME: Reads the log filter from TUTORBOX_LOG, then RUST_LOG, then defaults to info

use tracing_subscriber::EnvFilter;
use tutorbox_config::constants::{RUST_LOG, TUTORBOX_LOG};

const DEFAULT_FILTER: &str = "info";

/// Filter directive picked from the environment lookup.
pub fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    non_empty(lookup(TUTORBOX_LOG))
        .or_else(|| non_empty(lookup(RUST_LOG)))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the global subscriber. Logs go to stderr so they never interleave
/// with process output on stdout.
pub fn init_tracing() {
    let directive = filter_directive(|key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_tutorbox_log_wins() {
        let directive = filter_directive(lookup(&[
            (TUTORBOX_LOG, "tutorbox_runtime=debug"),
            (RUST_LOG, "warn"),
        ]));
        assert_eq!(directive, "tutorbox_runtime=debug");
    }

    #[test]
    fn test_falls_back_to_rust_log_then_info() {
        assert_eq!(filter_directive(lookup(&[(RUST_LOG, "warn")])), "warn");
        assert_eq!(
            filter_directive(lookup(&[(TUTORBOX_LOG, " "), (RUST_LOG, "warn")])),
            "warn"
        );
        assert_eq!(filter_directive(lookup(&[])), "info");
    }
}
