// ABOUTME: Integration tests for the sandbox lifecycle through the boot gate
// ABOUTME: Boots the local provider, mounts files, runs processes, and observes fs events

use std::sync::Arc;
use std::time::Duration;
use tutorbox_config::BootPolicy;
use tutorbox_core::{files_from, to_file_tree};
use tutorbox_sandbox::{
    BootGate, BootStatus, HostProfile, LocalProvider, MemoryProvider, ScriptedProcess,
    SpawnOptions, TerminalSize,
};

fn sh(command: &str) -> Vec<String> {
    vec!["-c".to_string(), command.to_string()]
}

/// Test complete lifecycle: gate → boot → mount → spawn → snapshot
#[cfg(unix)]
#[tokio::test]
async fn test_local_sandbox_lifecycle() {
    let gate = BootGate::new(
        Arc::new(LocalProvider::without_watcher()),
        BootPolicy::Auto,
        HostProfile::desktop(),
    );

    let sandbox = gate.request_boot().await.expect("Failed to boot local sandbox");
    assert_eq!(gate.status(), BootStatus::Unblocked);

    let files = files_from([("/package.json", "{}"), ("/src/index.js", "// entry")]);
    sandbox
        .mount(&to_file_tree(&files))
        .await
        .expect("Failed to mount files");

    let mut process = sandbox
        .spawn(
            "sh",
            &sh("mkdir -p dist && cp src/index.js dist/index.js && echo built"),
            SpawnOptions {
                terminal: Some(TerminalSize::new(120, 40)),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to spawn build");

    assert_eq!((&mut process.exit).await, Ok(0));
    assert_eq!(process.output.recv().await, Some("built\n".to_string()));

    let snapshot = sandbox.snapshot().await.expect("Failed to snapshot");
    assert_eq!(
        snapshot.keys().cloned().collect::<Vec<_>>(),
        vec!["/dist/index.js", "/package.json", "/src/index.js"]
    );
}

/// Test that the local watcher reports writes made by processes
#[cfg(unix)]
#[tokio::test]
async fn test_local_watcher_reports_process_writes() {
    let gate = BootGate::new(
        Arc::new(LocalProvider::new()),
        BootPolicy::Unblocked,
        HostProfile::desktop(),
    );
    let sandbox = gate.request_boot().await.expect("Failed to boot local sandbox");
    let mut events = sandbox.subscribe_fs();

    let process = sandbox
        .spawn("sh", &sh("echo hello > notes.txt"), SpawnOptions::default())
        .await
        .expect("Failed to spawn writer");
    assert_eq!(process.exit.await, Ok(0));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("No filesystem event received")
        .expect("Event channel closed");
    assert!(event.paths.contains(&"/notes.txt".to_string()));
}

/// Test that a blocked gate defers boot until unblocked
#[tokio::test]
async fn test_blocked_gate_defers_boot() {
    let provider = MemoryProvider::new();
    provider
        .sandbox()
        .script("npm install", ScriptedProcess::exit(0).with_output("added 1 package\n"));
    let gate = Arc::new(BootGate::new(
        Arc::new(provider.clone()),
        BootPolicy::Auto,
        HostProfile::mobile(Some(2.0)),
    ));

    let waiting = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.request_boot().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gate.is_blocked(), Some(true));
    assert!(!waiting.is_finished());

    gate.unblock();
    let sandbox = waiting
        .await
        .expect("Boot task panicked")
        .expect("Boot failed");

    let mut process = sandbox
        .spawn("jsh", &sh("npm install"), SpawnOptions::default())
        .await
        .expect("Failed to spawn");
    assert_eq!(
        process.output.recv().await,
        Some("added 1 package\n".to_string())
    );
    assert_eq!(provider.boot_count(), 1);
}
