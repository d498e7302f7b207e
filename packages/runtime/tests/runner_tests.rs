// ABOUTME: Integration tests for the tutorial runner against the memory sandbox
// ABOUTME: Covers mount ordering, the command pipeline, and filesystem reconciliation

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tutorbox_config::BootPolicy;
use tutorbox_core::{files_from, CommandsSchema, FileContent, StepStatus};
use tutorbox_runtime::{DocumentChange, TranscriptSink, TutorialRunner};
use tutorbox_sandbox::{
    BootGate, HostProfile, LocalProvider, MemoryProvider, MemorySandbox, Sandbox, ScriptedProcess,
    TerminalSize,
};

fn runner_with(policy: BootPolicy) -> (TutorialRunner, Arc<MemorySandbox>) {
    let provider = MemoryProvider::new();
    let sandbox = provider.sandbox();
    let gate = Arc::new(BootGate::new(
        Arc::new(provider),
        policy,
        HostProfile::desktop(),
    ));
    (
        TutorialRunner::new(gate, "jsh", TerminalSize::default()),
        sandbox,
    )
}

fn runner() -> (TutorialRunner, Arc<MemorySandbox>) {
    runner_with(BootPolicy::Unblocked)
}

fn commands(json: &str) -> CommandsSchema {
    serde_json::from_str(json).unwrap()
}

fn statuses(runner: &TutorialRunner) -> Vec<StepStatus> {
    runner.steps().steps().into_iter().map(|s| s.status).collect()
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timed out waiting for condition");
}

#[tokio::test]
async fn test_mount_precedes_sequential_commands() {
    let (runner, sandbox) = runner();
    let transcript = Arc::new(TranscriptSink::new());
    runner.output().register(transcript.clone());

    let release = Arc::new(Notify::new());
    sandbox.script(
        "npm install",
        ScriptedProcess::exit(0)
            .with_output("added 1 package\n")
            .held_by(release.clone()),
    );

    runner.set_commands(&commands(
        r#"{"prepareCommands": ["npm install"], "mainCommand": "npm run start"}"#,
    ));
    assert_eq!(statuses(&runner), vec![StepStatus::Idle, StepStatus::Idle]);

    let prepared = runner.prepare_files(
        files_from([("/a.js", "x")]),
        files_from([("/package.json", "{}")]),
    );
    let run = runner.run_commands();

    wait_until(|| sandbox.spawned_commands().len() == 1).await;
    assert_eq!(
        sandbox.files().await,
        files_from([("/a.js", "x"), ("/package.json", "{}")])
    );
    assert_eq!(statuses(&runner), vec![StepStatus::Running, StepStatus::Idle]);

    release.notify_one();
    prepared.await.unwrap();
    run.await.unwrap();

    assert_eq!(
        sandbox.spawned_commands(),
        vec!["npm install".to_string(), "npm run start".to_string()]
    );
    assert_eq!(
        statuses(&runner),
        vec![StepStatus::Completed, StepStatus::Completed]
    );
    assert_eq!(transcript.contents(), "added 1 package\n");

    let first = &sandbox.spawned()[0];
    assert_eq!(first.program, "jsh");
    assert_eq!(first.args, vec!["-c".to_string(), "npm install".to_string()]);
    assert_eq!(first.terminal, Some(TerminalSize::new(80, 24)));
}

#[tokio::test]
async fn test_failing_command_skips_the_rest() {
    let (runner, sandbox) = runner();
    sandbox.script("npm test", ScriptedProcess::exit(1).with_output("1 failing\n"));

    runner.set_commands(&commands(
        r#"{"prepareCommands": ["npm install", "npm test"], "mainCommand": "npm run dev"}"#,
    ));
    runner.run_commands().await.unwrap();

    assert_eq!(
        statuses(&runner),
        vec![
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped
        ]
    );
    assert_eq!(
        sandbox.spawned_commands(),
        vec!["npm install".to_string(), "npm test".to_string()]
    );
}

#[tokio::test]
async fn test_blank_commands_complete_without_spawning() {
    let (runner, sandbox) = runner();
    runner.set_commands(&commands(
        r#"{"prepareCommands": [["", "Nothing to do"]], "mainCommand": "node index.js"}"#,
    ));
    runner.run_commands().await.unwrap();

    assert_eq!(
        statuses(&runner),
        vec![StepStatus::Completed, StepStatus::Completed]
    );
    assert_eq!(sandbox.spawned_commands(), vec!["node index.js".to_string()]);
}

#[tokio::test]
async fn test_new_run_kills_the_previous_one() {
    let (runner, sandbox) = runner();
    let release = Arc::new(Notify::new());
    sandbox.script(
        "npm run dev",
        ScriptedProcess::exit(0).held_by(release.clone()),
    );
    runner.set_commands(&commands(r#"{"mainCommand": "npm run dev"}"#));

    let first = runner.run_commands();
    wait_until(|| sandbox.spawned_commands().len() == 1).await;

    let second = runner.run_commands();
    assert!(first.await.unwrap_err().is_aborted());

    wait_until(|| sandbox.spawned_commands().len() == 2).await;
    release.notify_one();
    second.await.unwrap();
    assert_eq!(statuses(&runner), vec![StepStatus::Completed]);
}

#[tokio::test]
async fn test_resize_reaches_running_process() {
    let (runner, sandbox) = runner();
    let release = Arc::new(Notify::new());
    sandbox.script("npm run dev", ScriptedProcess::exit(0).held_by(release.clone()));
    runner.set_commands(&commands(r#"{"mainCommand": "npm run dev"}"#));

    let run = runner.run_commands();
    wait_until(|| sandbox.spawned_commands().len() == 1).await;

    runner.output().resize(TerminalSize::new(120, 40));
    wait_until(|| sandbox.resizes() == vec![TerminalSize::new(120, 40)]).await;

    release.notify_one();
    run.await.unwrap();
}

#[tokio::test]
async fn test_remounting_identical_files_is_silent() {
    let (runner, sandbox) = runner();
    let files = files_from([("/index.js", "x")]);
    let template = files_from([("/package.json", "{}")]);

    runner
        .prepare_files(files.clone(), template.clone())
        .await
        .unwrap();
    runner.editor().set_documents(&files);
    let mut changes = runner.editor().subscribe_changes();

    runner.prepare_files(files, template).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sandbox.mount_count(), 1);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_changed_lesson_files_replace_stale_ones() {
    let (runner, sandbox) = runner();
    runner
        .prepare_files(files_from([("/old.js", "1")]), files_from([("/package.json", "{}")]))
        .await
        .unwrap();
    runner
        .prepare_files(files_from([("/new.js", "2")]), files_from([("/package.json", "{}")]))
        .await
        .unwrap();

    assert_eq!(
        sandbox.files().await,
        files_from([("/new.js", "2"), ("/package.json", "{}")])
    );
}

#[tokio::test]
async fn test_sandbox_changes_reach_the_editor() {
    let (runner, sandbox) = runner();
    let files = files_from([("/a.js", "x"), ("/b.js", "y")]);
    runner.prepare_files(files.clone(), Default::default()).await.unwrap();
    runner.editor().set_documents(&files);

    sandbox.write_external("/dist/out.js", "built").await;
    sandbox.remove_external("/b.js").await;
    sandbox
        .write_external("/node_modules/dep/index.js", "dep")
        .await;

    let editor = runner.editor().clone();
    wait_until(move || {
        editor.document("/dist/out.js").is_some() && editor.document("/b.js").is_none()
    })
    .await;

    assert_eq!(
        runner.editor().document("/dist/out.js").unwrap().value,
        FileContent::from("built")
    );
    assert!(runner.editor().document("/node_modules/dep/index.js").is_none());
    assert!(runner.editor().document("/a.js").is_some());
}

#[tokio::test]
async fn test_editor_writes_are_not_echoed_back() {
    let (runner, sandbox) = runner();
    let files = files_from([("/a.js", "x")]);
    runner.prepare_files(files.clone(), Default::default()).await.unwrap();
    runner.editor().set_documents(&files);
    let mut changes = runner.editor().subscribe_changes();

    runner.update_file("/a.js", "y".into()).await.unwrap();
    assert_eq!(sandbox.read_file("/a.js").await.unwrap(), "y".into());

    sandbox.write_external("/marker.txt", "done").await;
    let editor = runner.editor().clone();
    wait_until(move || editor.document("/marker.txt").is_some()).await;

    assert_eq!(runner.editor().document("/a.js").unwrap().value, "x".into());
    let change = changes.try_recv().unwrap();
    assert!(matches!(change, DocumentChange::Updated { ref path, .. } if path == "/marker.txt"));
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_watch_patterns_limit_reconciliation() {
    let (runner, sandbox) = runner();
    runner
        .set_watch_patterns(&["src/**".to_string()])
        .unwrap();
    runner
        .prepare_files(files_from([("/src/index.js", "x")]), Default::default())
        .await
        .unwrap();

    sandbox.write_external("/dist/bundle.js", "built").await;
    sandbox.write_external("/src/generated.js", "gen").await;

    let editor = runner.editor().clone();
    wait_until(move || editor.document("/src/generated.js").is_some()).await;
    assert!(runner.editor().document("/dist/bundle.js").is_none());
}

#[tokio::test]
async fn test_folder_operations() {
    let (runner, sandbox) = runner();
    runner.create_folder("/src/lib").await.unwrap();
    assert!(sandbox.has_directory("/src/lib").await);

    runner
        .update_files(
            &Default::default(),
            &files_from([("/src/lib/util.js", "u"), ("/index.js", "i")]),
        )
        .await
        .unwrap();
    runner.delete_path("/src").await.unwrap();

    assert_eq!(
        runner.take_snapshot().await.unwrap(),
        files_from([("/index.js", "i")])
    );
    assert!(!sandbox.has_directory("/src").await);
}

#[tokio::test]
async fn test_blocked_gate_defers_mount() {
    let (runner, sandbox) = runner_with(BootPolicy::Blocked);
    let prepared = runner.prepare_files(files_from([("/a.js", "x")]), Default::default());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.gate().is_blocked(), Some(true));
    assert_eq!(sandbox.mount_count(), 0);

    runner.gate().unblock();
    prepared.await.unwrap();
    assert_eq!(sandbox.mount_count(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_mount_of_text_like_binary_stays_in_the_editor() {
    let gate = Arc::new(BootGate::new(
        Arc::new(LocalProvider::new()),
        BootPolicy::Unblocked,
        HostProfile::desktop(),
    ));
    let runner = TutorialRunner::new(gate, "sh", TerminalSize::default());
    let logo = FileContent::Binary(b"<svg/>".to_vec());
    let files = files_from([("/logo.svg", logo.clone()), ("/index.js", "x".into())]);

    runner.prepare_files(files.clone(), Default::default()).await.unwrap();
    runner.editor().set_documents(&files);
    let mut changes = runner.editor().subscribe_changes();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(runner.editor().document("/logo.svg").unwrap().value, logo);
    assert!(changes.try_recv().is_err());
    assert_eq!(
        runner.take_snapshot().await.unwrap().get("/logo.svg").map(FileContent::as_bytes),
        Some(&b"<svg/>"[..])
    );
}
