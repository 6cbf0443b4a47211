#![cfg(unix)]

use std::time::Duration;

use agent_runner::pty::process::ProcessPtyManager;
use agent_runner::pty::{OutputStream, PtyEvent, PtyManager, PtyProcess, Signal, SpawnRequest};
use agent_runner::AppError;

fn shell(script: &str) -> SpawnRequest {
    SpawnRequest {
        command: "sh".into(),
        args: vec!["-c".into(), script.into()],
        cwd: std::env::temp_dir(),
        ..SpawnRequest::default()
    }
}

/// Drain events until exit; returns stdout text and the exit code.
async fn drain(process: &mut PtyProcess) -> (String, Option<i32>) {
    let mut stdout = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), process.events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open until exit");
        match event {
            PtyEvent::Data {
                stream: OutputStream::Stdout,
                data,
                ..
            } => stdout.extend(data),
            PtyEvent::Data { .. } => {}
            PtyEvent::Exit { exit_code, .. } => {
                return (String::from_utf8_lossy(&stdout).into_owned(), exit_code);
            }
        }
    }
}

#[tokio::test]
async fn echoes_input_and_reports_exit() {
    let pty = ProcessPtyManager::new();
    let mut process = pty
        .spawn("sess-1", shell("read line; echo \"got $line\"; exit 3"))
        .await
        .expect("spawn");
    assert!(process.pid > 0);
    assert!(pty.is_active("sess-1"));

    pty.write("sess-1", b"hello\n").await.expect("write");
    let (stdout, exit_code) = drain(&mut process).await;

    assert_eq!(stdout.trim(), "got hello");
    assert_eq!(exit_code, Some(3));
    assert!(!pty.is_active("sess-1"));
}

#[tokio::test]
#[serial_test::serial]
async fn session_id_is_exported_and_secrets_are_not() {
    std::env::set_var("AGENT_RUNNER_TOKEN", "secret");
    let pty = ProcessPtyManager::new();
    let mut process = pty
        .spawn(
            "sess-env",
            shell("echo \"$AGENT_RUNNER_SESSION_ID:${AGENT_RUNNER_TOKEN:-none}\""),
        )
        .await
        .expect("spawn");
    let (stdout, _) = drain(&mut process).await;
    std::env::remove_var("AGENT_RUNNER_TOKEN");

    assert_eq!(stdout.trim(), "sess-env:none");
}

#[tokio::test]
async fn resize_is_recorded_for_live_sessions() {
    let pty = ProcessPtyManager::new();
    let mut process = pty.spawn("sess-2", shell("exec sleep 30")).await.expect("spawn");

    assert_eq!(pty.size("sess-2"), Some((80, 24)));
    pty.resize("sess-2", 120, 40).expect("resize");
    assert_eq!(pty.size("sess-2"), Some((120, 40)));
    assert!(matches!(
        pty.resize("missing", 1, 1),
        Err(AppError::NotFound(_))
    ));

    pty.kill("sess-2", Signal::Kill).await.expect("kill");
    let (_, exit_code) = drain(&mut process).await;
    assert_eq!(exit_code, None);
}

#[tokio::test]
async fn terminate_stops_the_process() {
    let pty = ProcessPtyManager::new();
    let mut process = pty.spawn("sess-3", shell("exec sleep 30")).await.expect("spawn");

    pty.kill("sess-3", Signal::Terminate).await.expect("terminate");
    drain(&mut process).await;
    assert!(!pty.is_active("sess-3"));

    pty.kill("sess-3", Signal::Kill).await.expect("unknown session is a no-op");
}

#[tokio::test]
async fn duplicate_spawn_is_rejected() {
    let pty = ProcessPtyManager::new();
    let mut process = pty.spawn("sess-4", shell("exec sleep 30")).await.expect("spawn");

    let err = pty
        .spawn("sess-4", shell("true"))
        .await
        .err()
        .expect("duplicate");
    assert!(matches!(err, AppError::AlreadyExists(_)));

    pty.kill("sess-4", Signal::Kill).await.expect("kill");
    drain(&mut process).await;
}

#[tokio::test]
async fn write_to_unknown_session_is_not_found() {
    let pty = ProcessPtyManager::new();
    let err = pty.write("nobody", b"x").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));
}
