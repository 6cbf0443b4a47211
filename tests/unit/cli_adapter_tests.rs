use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_runner::models::policy::PolicySpec;
use agent_runner::provider::generic::GenericProfile;
use agent_runner::provider::{CliAdapter, ProviderAdapter, ProviderEvent, StartArgs};
use agent_runner::pty::{
    OutputStream, PtyEvent, PtyFuture, PtyManager, PtyProcess, Signal, SpawnRequest,
};
use agent_runner::Result;
use chrono::Utc;
use tokio::sync::mpsc;

/// Replays fixed output chunks followed by an exit.
struct ScriptedPty {
    chunks: Vec<Vec<u8>>,
}

impl PtyManager for ScriptedPty {
    fn spawn<'a>(&'a self, session_id: &'a str, _request: SpawnRequest) -> PtyFuture<'a, PtyProcess> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(self.chunks.len() + 1);
            for chunk in &self.chunks {
                tx.send(PtyEvent::Data {
                    session_id: session_id.to_owned(),
                    stream: OutputStream::Stdout,
                    data: chunk.clone(),
                    timestamp: Utc::now(),
                })
                .await
                .expect("send chunk");
            }
            tx.send(PtyEvent::Exit {
                session_id: session_id.to_owned(),
                exit_code: Some(0),
            })
            .await
            .expect("send exit");
            Ok(PtyProcess { pid: 7, events: rx })
        })
    }

    fn write<'a>(&'a self, _session_id: &'a str, _data: &'a [u8]) -> PtyFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn resize(&self, _session_id: &str, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn kill<'a>(&'a self, _session_id: &'a str, _signal: Signal) -> PtyFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn is_active(&self, _session_id: &str) -> bool {
        false
    }
}

async fn run_script(chunks: Vec<Vec<u8>>) -> Vec<ProviderEvent> {
    let adapter = CliAdapter::new(
        GenericProfile::new("scripted", "agent-runner-missing-binary"),
        Arc::new(ScriptedPty { chunks }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    adapter.on_event(Arc::new(move |event: &ProviderEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    adapter
        .start_session(StartArgs {
            session_id: "sess-1".into(),
            repo_path: PathBuf::from("/work/sess-1"),
            task: "echo".into(),
            policy: PolicySpec::default(),
            env: HashMap::new(),
        })
        .await
        .expect("start");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stopped = seen
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, ProviderEvent::Stopped { .. }));
        if stopped || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = seen.lock().unwrap().clone();
    events
}

fn output_text(events: &[ProviderEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ProviderEvent::Message { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn code_point_split_across_chunks_survives() {
    let mut first = vec![b'a'; 8191];
    let bytes = "é done\n".as_bytes();
    first.push(bytes[0]);
    let events = run_script(vec![first, bytes[1..].to_vec()]).await;

    let text = output_text(&events);
    assert_eq!(text.len(), 8191 + bytes.len());
    assert!(text.ends_with("é done\n"));
    assert!(!text.contains(char::REPLACEMENT_CHARACTER));
    assert!(events
        .iter()
        .any(|event| matches!(event, ProviderEvent::Stopped { exit_code: Some(0), .. })));
}

#[tokio::test]
async fn truncated_tail_is_flushed_at_exit() {
    let events = run_script(vec![b"partial \xe2\x82".to_vec()]).await;
    assert_eq!(output_text(&events), "partial \u{fffd}");
}
