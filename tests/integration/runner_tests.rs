//! End-to-end runner tests: commands arrive over the control-plane stream,
//! runner events flow back over it.

use std::time::Duration;

use agent_runner::models::command::SessionCommand;
use agent_runner::models::session::SessionState;
use agent_runner::provider::ProviderEvent;
use agent_runner::pty::OutputStream;
use agent_runner::stream::StreamHealth;
use agent_runner::AppError;
use serde_json::Value;

use super::test_helpers::{session_config, state_of, wait_until, FakeControlPlane, RunnerFixture};

const START: &str = r#"{"type":"START","config":{"sessionId":"sess-1","orgId":"org-1","providerId":"mock","task":"fix the failing test"}}"#;

/// Read events until one of type `kind` arrives; returns every event read.
async fn read_until(plane: &mut FakeControlPlane, kind: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    while let Some(event) = plane.next_event().await {
        let done = event["type"] == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("no {kind} event; saw {seen:?}");
}

#[tokio::test]
async fn start_command_runs_a_session_and_streams_events() {
    let mut fixture = RunnerFixture::new();
    let mut plane = fixture.start_online().await;

    plane.send(START).await;

    let events = read_until(&mut plane, "SESSION_STARTED").await;
    let types: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(
        types,
        vec![
            "SESSION_STATE_CHANGED",
            "SESSION_STATE_CHANGED",
            "SESSION_STATE_CHANGED",
            "SESSION_STARTED",
        ]
    );
    let targets: Vec<&str> = events.iter().filter_map(|e| e["to"].as_str()).collect();
    assert_eq!(targets, vec!["PREPARING_WORKSPACE", "STARTING_PROVIDER", "RUNNING"]);
    let seqs: Vec<u64> = events.iter().filter_map(|e| e["seq"].as_u64()).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(events[3]["providerId"], "mock");
    assert_eq!(events[3]["orgId"], "org-1");
    assert!(events[3].get("repoRef").is_none());

    let adapter = fixture.factory.last().expect("adapter created");
    adapter.emit(ProviderEvent::Message {
        stream: OutputStream::Stdout,
        text: "compiling\n".into(),
    });
    let output = plane.next_event().await.expect("terminal output");
    assert_eq!(output["type"], "TERMINAL_OUTPUT");
    assert_eq!(output["data"], "compiling\n");
    assert_eq!(output["seq"], 5);

    plane
        .send(r#"{"type":"STOP","sessionId":"sess-1"}"#)
        .await;
    let events = read_until(&mut plane, "SESSION_ENDED").await;
    let ended = events.last().expect("ended");
    assert_eq!(ended["outcome"], "COMPLETED");
    assert_eq!(ended["reason"], "stopped by operator");
    assert!(fixture.runner.sessions().get_session_state("sess-1").is_none());

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn approval_round_trip_over_the_stream() {
    let mut fixture = RunnerFixture::new();
    let mut plane = fixture.start_online().await;

    plane.send(START).await;
    read_until(&mut plane, "SESSION_STARTED").await;

    let adapter = fixture.factory.last().expect("adapter created");
    adapter.emit(ProviderEvent::RequestApproval {
        approval_id: Some("ap-1".into()),
        category: agent_runner::models::approval::ApprovalCategory::GitPush,
        risk: agent_runner::models::approval::RiskLevel::High,
        summary: "git push".into(),
    });
    let requested = read_until(&mut plane, "APPROVAL_REQUESTED").await;
    let approval = &requested.last().expect("requested")["approval"];
    assert_eq!(approval["id"], "ap-1");
    assert_eq!(approval["category"], "git_push");

    plane
        .send(r#"{"type":"APPROVE","sessionId":"sess-1","approvalId":"ap-1","decision":"approve"}"#)
        .await;
    let resolved = read_until(&mut plane, "APPROVAL_RESOLVED").await;
    assert_eq!(resolved.last().expect("resolved")["decision"], "approved");

    let runner = &fixture.runner;
    assert!(
        wait_until(|| state_of(runner.sessions(), "sess-1") == Some(SessionState::Running)).await
    );
    assert!(wait_until(|| adapter.inputs() == vec!["y\n".to_owned()]).await);

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn heartbeats_are_sent_while_connected() {
    let mut fixture = RunnerFixture::new();
    let mut plane = fixture.start_online().await;

    let mut heartbeat = None;
    for _ in 0..5 {
        match plane.next_json().await {
            Some(frame) if frame["type"] == "RUNNER_HEARTBEAT" => {
                heartbeat = Some(frame);
                break;
            }
            Some(_) => {}
            None => break,
        }
    }
    let heartbeat = heartbeat.expect("heartbeat within the interval");
    assert_eq!(heartbeat["runner"]["runnerId"], "runner-1");
    assert_eq!(heartbeat["runner"]["capabilities"][0], "mock");
    assert_eq!(heartbeat["runner"]["providerVersions"]["mock"], "1.0.0");

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn unreachable_control_plane_does_not_fail_start() {
    let fixture = RunnerFixture::new();
    fixture.start_offline().await;

    assert!(!fixture.runner.is_healthy());
    assert_eq!(fixture.runner.stream().health(), StreamHealth::Unhealthy);

    // Sessions still run; their events are buffered.
    fixture
        .runner
        .dispatch(SessionCommand::Start {
            config: session_config("sess-1"),
        })
        .await
        .expect("dispatch start");
    let runner = &fixture.runner;
    assert!(
        wait_until(|| state_of(runner.sessions(), "sess-1") == Some(SessionState::Running)).await
    );
    assert!(fixture.runner.stream().buffered() >= 4);

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn dispatch_reports_manager_errors() {
    let fixture = RunnerFixture::new();
    fixture.start_offline().await;

    let err = fixture
        .runner
        .dispatch(SessionCommand::Pause {
            session_id: "missing".into(),
        })
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)), "got {err}");

    let mut config = session_config("sess-1");
    config.provider_id = "nope".into();
    let err = fixture
        .runner
        .dispatch(SessionCommand::Start { config })
        .await
        .expect_err("unknown provider");
    assert!(matches!(err, AppError::Validation(_)), "got {err}");
    assert!(fixture.runner.sessions().get_session_state("sess-1").is_none());

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn runner_info_describes_capacity_and_providers() {
    let fixture = RunnerFixture::new();
    fixture.start_offline().await;
    fixture
        .runner
        .dispatch(SessionCommand::Start {
            config: session_config("sess-1"),
        })
        .await
        .expect("dispatch start");

    let info = fixture.runner.runner_info();
    assert_eq!(info.runner_id, "runner-1");
    assert_eq!(info.active_session_count, 1);
    assert_eq!(info.max_sessions, 10);
    assert_eq!(info.capabilities, vec!["mock".to_owned()]);
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));

    fixture.runner.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_stops_sessions() {
    let fixture = RunnerFixture::new();
    fixture.start_offline().await;
    fixture
        .runner
        .dispatch(SessionCommand::Start {
            config: session_config("sess-1"),
        })
        .await
        .expect("dispatch start");
    let runner = &fixture.runner;
    assert!(
        wait_until(|| state_of(runner.sessions(), "sess-1") == Some(SessionState::Running)).await
    );

    tokio::time::timeout(Duration::from_secs(10), async {
        fixture.runner.shutdown().await;
        fixture.runner.shutdown().await;
    })
    .await
    .expect("shutdown completes");

    assert!(fixture.runner.sessions().get_active_sessions().is_empty());
    assert_eq!(fixture.runner.stream().health(), StreamHealth::Closed);
    let adapter = fixture.factory.last().expect("adapter");
    assert_eq!(adapter.stop_calls(), 1);
}

#[tokio::test]
async fn blocked_input_on_one_session_does_not_hold_up_another() {
    let mut fixture = RunnerFixture::new();
    let mut plane = fixture.start_online().await;

    plane.send(START).await;
    read_until(&mut plane, "SESSION_STARTED").await;
    let first = fixture.factory.last().expect("first adapter");
    let release = first.hold_input();

    plane
        .send(&START.replace("sess-1", "sess-2"))
        .await;
    read_until(&mut plane, "SESSION_STARTED").await;

    plane
        .send(r#"{"type":"INPUT","sessionId":"sess-1","data":"hello\n"}"#)
        .await;
    plane
        .send(r#"{"type":"PAUSE","sessionId":"sess-2"}"#)
        .await;
    plane
        .send(r#"{"type":"INPUT","sessionId":"sess-1","data":"again\n"}"#)
        .await;

    let runner = &fixture.runner;
    assert!(
        wait_until(|| state_of(runner.sessions(), "sess-2") == Some(SessionState::PausedByHuman))
            .await
    );
    assert!(first.inputs().is_empty());

    release.notify_one();
    assert!(wait_until(|| first.inputs() == vec!["hello\n".to_owned()]).await);
    release.notify_one();
    assert!(
        wait_until(|| first.inputs() == vec!["hello\n".to_owned(), "again\n".to_owned()]).await
    );

    fixture.runner.shutdown().await;
}
