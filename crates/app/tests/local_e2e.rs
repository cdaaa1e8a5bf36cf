#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use app::{Orchestrator, RunRequest, build_broker};
use common::{has_tool, settled, test_config};
use sandbox::local::LocalProvider;
use sandbox::{CapabilityRegistry, FailureReason};

fn local_broker(capacity: usize) -> Orchestrator {
    let mut config = test_config(capacity);
    config.languages = vec!["bash".to_owned(), "python".to_owned()];
    build_broker(
        Arc::new(LocalProvider::new()),
        CapabilityRegistry::builtin(),
        &config,
    )
}

fn run(language: &str, source: &str) -> RunRequest {
    RunRequest {
        language: language.to_owned(),
        source: source.to_owned(),
        ..RunRequest::default()
    }
}

#[tokio::test]
async fn bash_one_shot_run() {
    if !has_tool("bash") {
        eprintln!("skipping: bash not installed");
        return;
    }
    let broker = local_broker(2);
    let outcome = broker.run(run("shell", "echo $((1+1))")).await.unwrap();
    assert_eq!(outcome.outcome.output, "2\n");
    assert_eq!(outcome.outcome.exit_code, 0);
    broker.pool().drain().await;
}

#[tokio::test]
async fn python_one_shot_run() {
    if !has_tool("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let broker = local_broker(2);
    let outcome = broker.run(run("python", "print(1+1)")).await.unwrap();
    assert_eq!(outcome.outcome.output, "2\n");
    let stats = settled(broker.pool()).await;
    assert_eq!(stats.idle_for("python"), 1);
    broker.pool().drain().await;
}

#[tokio::test]
async fn bash_session_keeps_files_between_runs() {
    if !has_tool("bash") {
        eprintln!("skipping: bash not installed");
        return;
    }
    let broker = local_broker(1);
    let session = broker.sessions().create("bash", "alice").await.unwrap();
    let mut first = run("bash", "echo kept > note.txt");
    first.session_id = Some(session.session_id.clone());
    broker.run(first).await.unwrap();

    let mut second = run("bash", "cat note.txt");
    second.session_id = Some(session.session_id.clone());
    let outcome = broker.run(second).await.unwrap();
    assert_eq!(outcome.outcome.output, "kept\n");

    broker.sessions().end(&session.session_id).await.unwrap();
    settled(broker.pool()).await;
    let outcome = broker.run(run("bash", "ls -A")).await.unwrap();
    assert!(!outcome.outcome.output.contains("note.txt"));
    broker.pool().drain().await;
}

#[tokio::test]
async fn runaway_process_is_killed_before_reuse() {
    if !has_tool("bash") {
        eprintln!("skipping: bash not installed");
        return;
    }
    let broker = local_broker(1);
    let mut hung = run("bash", "sleep 30");
    hung.timeout = Some(Duration::from_secs(1));
    let outcome = broker.run(hung).await.unwrap();
    assert_eq!(outcome.outcome.failure, Some(FailureReason::Timeout));

    let stats = settled(broker.pool()).await;
    assert_eq!(stats.idle_for("bash"), 1);
    let outcome = broker.run(run("bash", "echo ready")).await.unwrap();
    assert_eq!(outcome.outcome.output, "ready\n");
    broker.pool().drain().await;
}
