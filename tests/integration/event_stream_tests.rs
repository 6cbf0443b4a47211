//! Integration tests for control-plane delivery over an in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use agent_runner::config::RunnerMode;
use agent_runner::models::command::SessionCommand;
use agent_runner::models::event::{RunnerEvent, RunnerEventPayload};
use agent_runner::models::runner_info::RunnerInfo;
use agent_runner::stream::{EventStream, EventStreamOptions, StreamHealth};
use chrono::Utc;
use tokio::sync::mpsc;

use super::test_helpers::{stream_options, wait_until, FakeControlPlane, MemoryTransport};

fn file_event(session_id: &str, seq: u64) -> RunnerEvent {
    RunnerEvent {
        payload: RunnerEventPayload::FileTouched {
            path: format!("src/{seq}.rs"),
            reason: "read".into(),
        },
        session_id: session_id.into(),
        org_id: "org-1".into(),
        ts: Utc::now(),
        seq,
        repo_ref: None,
    }
}

fn runner_info() -> RunnerInfo {
    RunnerInfo {
        runner_id: "runner-1".into(),
        mode: RunnerMode::SelfHosted,
        version: "0.1.0".into(),
        capabilities: vec!["mock".into()],
        active_session_count: 0,
        max_sessions: 10,
        last_heartbeat_at: Utc::now(),
        provider_versions: Default::default(),
    }
}

/// Connect `stream` while a fake control plane accepts the first dial.
async fn connect(
    stream: &EventStream,
    peers: &mut mpsc::UnboundedReceiver<tokio::io::DuplexStream>,
) -> (FakeControlPlane, serde_json::Value) {
    let connecting = tokio::spawn({
        let stream = stream.clone();
        async move { stream.connect().await }
    });
    let server = peers.recv().await.expect("runner dials");
    let (plane, auth) = FakeControlPlane::accept(server).await;
    connecting
        .await
        .expect("connect task")
        .expect("connect succeeds");
    (plane, auth)
}

#[tokio::test]
async fn handshake_sends_token_and_runner_id() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);

    let (_plane, auth) = connect(&stream, &mut peers).await;

    assert_eq!(auth["type"], "AUTH");
    assert_eq!(auth["token"], "secret");
    assert_eq!(auth["runnerId"], "runner-1");
    assert!(wait_until(|| stream.health() == StreamHealth::Connected).await);
    assert!(stream.is_healthy());
    stream.close();
}

#[tokio::test]
async fn buffered_events_are_flushed_in_order_after_connect() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);

    for seq in 1..=5 {
        stream.send(&file_event("sess-1", seq)).expect("queue");
    }
    assert_eq!(stream.buffered(), 5);

    let (mut plane, _auth) = connect(&stream, &mut peers).await;

    for expected in 1..=5_u64 {
        let event = plane.next_event().await.expect("event delivered");
        assert_eq!(event["type"], "FILE_TOUCHED");
        assert_eq!(event["sessionId"], "sess-1");
        assert_eq!(event["seq"], expected);
    }
    assert!(wait_until(|| stream.buffered() == 0).await);
    stream.close();
}

#[tokio::test]
async fn events_sent_while_connected_are_delivered_once() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (mut plane, _auth) = connect(&stream, &mut peers).await;

    stream.send(&file_event("sess-1", 1)).expect("queue");
    stream.send(&file_event("sess-1", 2)).expect("queue");

    assert_eq!(plane.next_event().await.expect("first")["seq"], 1);
    assert_eq!(plane.next_event().await.expect("second")["seq"], 2);

    stream.close();
    assert!(plane.next_event().await.is_none());
}

#[tokio::test]
async fn rejected_auth_marks_stream_unhealthy() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);

    let rejecter = tokio::spawn(async move {
        while let Some(server) = peers.recv().await {
            FakeControlPlane::reject(server).await;
        }
    });

    let err = stream.connect().await.expect_err("auth rejected");
    assert!(err.to_string().contains("authentication rejected"), "{err}");
    assert_eq!(stream.health(), StreamHealth::Unhealthy);
    assert!(!stream.is_healthy());

    stream.close();
    assert_eq!(stream.health(), StreamHealth::Closed);
    rejecter.abort();
}

#[tokio::test]
async fn unreachable_control_plane_keeps_buffering() {
    let (transport, _peers) = MemoryTransport::new();
    transport.refuse_next(usize::MAX);
    let stream = EventStream::new(stream_options(), transport);

    let err = stream.connect().await.expect_err("refused");
    assert!(err.to_string().contains("after 2 attempts"), "{err}");
    assert_eq!(stream.health(), StreamHealth::Unhealthy);

    stream.send(&file_event("sess-1", 1)).expect("queue");
    assert_eq!(stream.buffered(), 1);
    stream.close();
}

#[tokio::test]
async fn recovers_after_transient_connect_failures() {
    let (transport, mut peers) = MemoryTransport::new();
    transport.refuse_next(1);
    let stream = EventStream::new(stream_options(), transport);

    let (_plane, auth) = connect(&stream, &mut peers).await;
    assert_eq!(auth["type"], "AUTH");
    assert!(wait_until(|| stream.health() == StreamHealth::Connected).await);
    stream.close();
}

#[tokio::test]
async fn inbound_commands_reach_listeners() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    stream.on_command(Arc::new(move |command: &SessionCommand| {
        let _ = tx.send(command.clone());
    }));

    let (mut plane, _auth) = connect(&stream, &mut peers).await;
    plane.send("not json").await;
    plane.send(r#"{"type":"PAUSE","sessionId":""}"#).await;
    plane
        .send(r#"{"type":"STOP","sessionId":"sess-1","graceful":false}"#)
        .await;

    let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("command in time")
        .expect("command");
    assert_eq!(
        command,
        SessionCommand::Stop {
            session_id: "sess-1".into(),
            graceful: false,
        }
    );
    assert!(rx.try_recv().is_err(), "invalid messages must be dropped");
    stream.close();
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (mut plane, _auth) = connect(&stream, &mut peers).await;

    plane
        .send(r#"{"type":"PING","ts":"2024-01-01T00:00:00Z"}"#)
        .await;

    let reply = plane.next_json().await.expect("pong");
    assert_eq!(reply["type"], "PONG");
    stream.close();
}

#[tokio::test]
async fn runner_pings_and_drops_silent_peer() {
    let (transport, mut peers) = MemoryTransport::new();
    let options = EventStreamOptions {
        ping_interval: Duration::from_millis(50),
        ..stream_options()
    };
    let stream = EventStream::new(options, transport);
    let (mut plane, _auth) = connect(&stream, &mut peers).await;

    let ping = plane.next_json().await.expect("ping");
    assert_eq!(ping["type"], "PING");

    // No PONG: the next tick drops the link and the runner dials again.
    let redial = tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("redial in time");
    assert!(redial.is_some());
    stream.close();
}

#[tokio::test]
async fn heartbeat_is_skipped_while_disconnected() {
    let (transport, _peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);

    assert!(!stream.send_heartbeat(runner_info()));
    assert_eq!(stream.buffered(), 0);
}

#[tokio::test]
async fn heartbeat_is_sent_while_connected() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (mut plane, _auth) = connect(&stream, &mut peers).await;
    assert!(wait_until(|| stream.health() == StreamHealth::Connected).await);

    assert!(stream.send_heartbeat(runner_info()));

    let frame = plane.next_json().await.expect("heartbeat");
    assert_eq!(frame["type"], "RUNNER_HEARTBEAT");
    assert_eq!(frame["runner"]["runnerId"], "runner-1");
    assert_eq!(frame["runner"]["mode"], "self_hosted");
    stream.close();
}

#[tokio::test]
async fn reconnects_and_delivers_events_buffered_while_down() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (mut plane, _auth) = connect(&stream, &mut peers).await;

    stream.send(&file_event("sess-1", 1)).expect("queue");
    assert_eq!(plane.next_event().await.expect("first")["seq"], 1);

    drop(plane);
    assert!(wait_until(|| stream.health() != StreamHealth::Connected).await);

    for seq in 2..=4 {
        stream.send(&file_event("sess-1", seq)).expect("queue");
    }

    let server = tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("redial in time")
        .expect("runner dials again");
    let (mut plane, _auth) = FakeControlPlane::accept(server).await;

    for expected in 2..=4_u64 {
        let event = plane.next_event().await.expect("buffered event");
        assert_eq!(event["seq"], expected);
    }
    assert!(wait_until(|| stream.health() == StreamHealth::Connected).await);
    stream.close();
}

#[tokio::test]
async fn connect_twice_is_a_no_op() {
    let (transport, mut peers) = MemoryTransport::new();
    let stream = EventStream::new(stream_options(), transport);
    let (_plane, _auth) = connect(&stream, &mut peers).await;

    stream.connect().await.expect("already driving");
    assert!(peers.try_recv().is_err(), "no second dial");
    stream.close();
}
