// ABOUTME: `tutorbox run` - loads a lesson descriptor and runs it in a local sandbox
// ABOUTME: Streams process output and prints step transitions and previews until done or Ctrl-C

use anyhow::{Context, Result};
use colored::*;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tutorbox_config::constants::TUTORBOX_SHELL;
use tutorbox_core::{Step, StepStatus};
use tutorbox_preview::PreviewInfo;
use tutorbox_runtime::{LessonDescriptor, TutorialSession};
use tutorbox_sandbox::{HostProfile, LocalProvider};

use tutorbox_cli::terminal::{changed_steps, render_preview, render_step, StdoutSink};

/// Shell used by the local provider unless TUTORBOX_SHELL says otherwise
const LOCAL_SHELL: &str = "sh";

/// Returns `false` when a step failed.
pub async fn run_lesson(lesson_path: &Path, content_url: Option<String>) -> Result<bool> {
    let mut config = super::load_config(content_url)?;
    if std::env::var(TUTORBOX_SHELL).is_err() {
        config.shell = LOCAL_SHELL.to_string();
    }

    let raw = tokio::fs::read_to_string(lesson_path)
        .await
        .with_context(|| format!("Failed to read lesson {}", lesson_path.display()))?;
    let lesson: LessonDescriptor = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid lesson descriptor {}", lesson_path.display()))?;

    let session = TutorialSession::from_config(
        Arc::new(LocalProvider::new()),
        &config,
        HostProfile::desktop(),
    )?;
    session
        .runner()
        .output()
        .register(Arc::new(StdoutSink::new()));

    let steps_printer = tokio::spawn(print_steps(session.steps().subscribe()));
    let previews_printer = tokio::spawn(print_previews(session.previews().subscribe()));

    println!("{}", format!("📚 Lesson {}", lesson.id).blue().bold());
    println!("{}", format!("Content server: {}", config.content_url).dimmed());
    println!();

    session.load_lesson(lesson).await?;

    tokio::select! {
        outcome = session.runner().wait_for_commands() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", "Stopping lesson...".yellow());
            session.runner().cancel_run();
        }
    }

    steps_printer.abort();
    previews_printer.abort();

    let steps = session.steps().steps();
    let failed = steps.iter().any(|step| step.status == StepStatus::Failed);
    println!();
    if failed {
        println!("{}", "❌ Lesson commands failed".red());
    } else {
        println!("{}", "✅ Lesson finished".green());
    }
    Ok(!failed)
}

async fn print_steps(mut steps: watch::Receiver<Vec<Step>>) {
    let mut previous: Vec<Step> = Vec::new();
    loop {
        let current = steps.borrow_and_update().clone();
        for index in changed_steps(&previous, &current) {
            println!("{}", render_step(index, &current[index]));
        }
        previous = current;

        if steps.changed().await.is_err() {
            break;
        }
    }
}

async fn print_previews(mut previews: watch::Receiver<Vec<PreviewInfo>>) {
    let mut previous = Vec::new();
    loop {
        let current: Vec<_> = previews
            .borrow_and_update()
            .iter()
            .map(PreviewInfo::state)
            .collect();
        for preview in current.iter().filter(|p| !previous.contains(*p)) {
            println!("{}", render_preview(preview));
        }
        previous = current;

        if previews.changed().await.is_err() {
            break;
        }
    }
}
