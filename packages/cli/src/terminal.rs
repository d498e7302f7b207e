// ABOUTME: Terminal rendering for lesson runs: process output, step transitions, previews
// ABOUTME: StdoutSink forwards sandbox output to the user's terminal

use colored::*;
use std::io::Write;
use tutorbox_core::{Step, StepStatus};
use tutorbox_preview::PreviewState;
use tutorbox_runtime::TerminalSink;

/// Writes process output straight to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl TerminalSink for StdoutSink {
    fn write(&self, data: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data.as_bytes());
        let _ = out.flush();
    }

    fn reset(&self) {}
}

pub fn render_step(index: usize, step: &Step) -> String {
    let marker = match step.status {
        StepStatus::Idle => "·".dimmed(),
        StepStatus::Running => "▶".cyan().bold(),
        StepStatus::Completed => "✔".green().bold(),
        StepStatus::Failed => "✖".red().bold(),
        StepStatus::Skipped => "↷".yellow(),
    };
    format!(
        "{} [{}] {} {}",
        marker,
        index + 1,
        step.title,
        format!("({})", step.status.as_str()).dimmed()
    )
}

pub fn render_preview(preview: &PreviewState) -> String {
    let name = preview
        .title
        .clone()
        .unwrap_or_else(|| format!("Port {}", preview.port));
    match (&preview.url, preview.ready) {
        (Some(url), true) => format!("{} {} {}", "●".green(), name.bold(), url.cyan()),
        _ => format!("{} {} {}", "○".dimmed(), name.bold(), "waiting for port".dimmed()),
    }
}

/// Indexes of `current` that differ from `previous` and are worth printing
pub fn changed_steps(previous: &[Step], current: &[Step]) -> Vec<usize> {
    current
        .iter()
        .enumerate()
        .filter(|(index, step)| {
            step.status != StepStatus::Idle && previous.get(*index) != Some(*step)
        })
        .map(|(index, _)| index)
        .collect()
}
