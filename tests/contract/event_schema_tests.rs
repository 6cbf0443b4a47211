//! Wire shape of runner events as consumed by the control plane.

use agent_runner::models::approval::{
    ApprovalCategory, ApprovalDecision, ApprovalRequest, RiskLevel,
};
use agent_runner::models::event::{
    RunnerEvent, RunnerEventKind, RunnerEventPayload, SessionOutcome, UsageMetrics,
};
use agent_runner::models::session::SessionState;
use agent_runner::pty::OutputStream;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

fn envelope(payload: RunnerEventPayload, repo_ref: Option<&str>) -> Value {
    let event = RunnerEvent {
        payload,
        session_id: "sess-1".into(),
        org_id: "org-1".into(),
        ts: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("ts"),
        seq: 7,
        repo_ref: repo_ref.map(str::to_owned),
    };
    serde_json::to_value(&event).expect("serialize")
}

#[test]
fn envelope_is_flat_and_camel_case() {
    let value = envelope(
        RunnerEventPayload::FileTouched {
            path: "a.ts".into(),
            reason: "read".into(),
        },
        Some("acme/widgets"),
    );
    assert_eq!(
        value,
        json!({
            "type": "FILE_TOUCHED",
            "path": "a.ts",
            "reason": "read",
            "sessionId": "sess-1",
            "orgId": "org-1",
            "ts": "2024-05-01T12:00:00Z",
            "seq": 7,
            "repoRef": "acme/widgets"
        })
    );
}

#[test]
fn repo_ref_is_omitted_when_absent() {
    let value = envelope(
        RunnerEventPayload::UsageTick {
            metrics: UsageMetrics::default(),
        },
        None,
    );
    assert!(value.get("repoRef").is_none());
    assert_eq!(
        value["metrics"],
        json!({
            "agentSeconds": 0.0,
            "terminalKb": 0.0,
            "filesTouched": 0,
            "commandsRun": 0,
            "approvalsRequested": 0
        })
    );
}

#[test]
fn lifecycle_payloads() {
    let changed = envelope(
        RunnerEventPayload::SessionStateChanged {
            from: SessionState::Running,
            to: SessionState::WaitingForApproval,
            reason: None,
        },
        None,
    );
    assert_eq!(changed["type"], "SESSION_STATE_CHANGED");
    assert_eq!(changed["from"], "RUNNING");
    assert_eq!(changed["to"], "WAITING_FOR_APPROVAL");
    assert!(changed.get("reason").is_none());

    let started = envelope(
        RunnerEventPayload::SessionStarted {
            provider_id: "claude-code".into(),
            pid: 4242,
            provider_version: Some("1.0.42".into()),
        },
        None,
    );
    assert_eq!(started["providerId"], "claude-code");
    assert_eq!(started["pid"], 4242);
    assert_eq!(started["providerVersion"], "1.0.42");

    let ended = envelope(
        RunnerEventPayload::SessionEnded {
            outcome: SessionOutcome::Failed,
            exit_code: Some(2),
            reason: Some("provider exited with code 2".into()),
            usage: UsageMetrics::default(),
        },
        None,
    );
    assert_eq!(ended["outcome"], "FAILED");
    assert_eq!(ended["exitCode"], 2);
    assert!(ended["usage"].is_object());
}

#[test]
fn output_and_activity_payloads() {
    let output = envelope(
        RunnerEventPayload::TerminalOutput {
            stream: OutputStream::Stderr,
            data: "warning\n".into(),
        },
        None,
    );
    assert_eq!(output["stream"], "stderr");
    assert_eq!(output["data"], "warning\n");

    let diff = envelope(
        RunnerEventPayload::DiffSummary {
            path: None,
            additions: 3,
            deletions: 1,
            summary: "+3 -1".into(),
        },
        None,
    );
    assert!(diff.get("path").is_none());
    assert_eq!(diff["additions"], 3);

    let command = envelope(
        RunnerEventPayload::CommandExecuted {
            tool: "Bash".into(),
            command: Some("cargo test".into()),
        },
        None,
    );
    assert_eq!(command["type"], "COMMAND_EXECUTED");
    assert_eq!(command["command"], "cargo test");

    let error = envelope(
        RunnerEventPayload::ProviderError {
            message: "boom".into(),
            fatal: true,
        },
        None,
    );
    assert_eq!(error["fatal"], true);
}

#[test]
fn approval_payloads() {
    let mut request = ApprovalRequest::new(
        Some("ap-1".into()),
        "sess-1".into(),
        ApprovalCategory::DependencyInstall,
        RiskLevel::Medium,
        "npm install left-pad".into(),
    );
    let requested = envelope(
        RunnerEventPayload::ApprovalRequested {
            approval: request.clone(),
        },
        None,
    );
    let approval = &requested["approval"];
    assert_eq!(approval["id"], "ap-1");
    assert_eq!(approval["sessionId"], "sess-1");
    assert_eq!(approval["category"], "dependency_install");
    assert_eq!(approval["risk"], "medium");
    assert!(approval["requestedAt"].is_string());
    assert!(approval["decision"].is_null());

    request.resolve(ApprovalDecision::Cancelled);
    let resolved = envelope(
        RunnerEventPayload::ApprovalResolved {
            approval_id: request.id.clone(),
            decision: ApprovalDecision::Cancelled,
            note: Some("session stopping".into()),
        },
        None,
    );
    assert_eq!(resolved["approvalId"], "ap-1");
    assert_eq!(resolved["decision"], "cancelled");
    assert_eq!(resolved["note"], "session stopping");
}

#[test]
fn every_kind_serialises_with_its_tag() {
    let payloads = [
        RunnerEventPayload::SessionStateChanged {
            from: SessionState::Created,
            to: SessionState::PreparingWorkspace,
            reason: None,
        },
        RunnerEventPayload::SessionStarted {
            provider_id: "codex".into(),
            pid: 1,
            provider_version: None,
        },
        RunnerEventPayload::SessionEnded {
            outcome: SessionOutcome::Completed,
            exit_code: None,
            reason: None,
            usage: UsageMetrics::default(),
        },
        RunnerEventPayload::TerminalOutput {
            stream: OutputStream::Stdout,
            data: String::new(),
        },
        RunnerEventPayload::FileTouched {
            path: "a".into(),
            reason: "write".into(),
        },
        RunnerEventPayload::DiffSummary {
            path: None,
            additions: 0,
            deletions: 0,
            summary: String::new(),
        },
        RunnerEventPayload::CommandExecuted {
            tool: "shell".into(),
            command: None,
        },
        RunnerEventPayload::ApprovalRequested {
            approval: ApprovalRequest::new(
                None,
                "sess-1".into(),
                ApprovalCategory::Other,
                RiskLevel::Low,
                String::new(),
            ),
        },
        RunnerEventPayload::ApprovalResolved {
            approval_id: "a".into(),
            decision: ApprovalDecision::Approved,
            note: None,
        },
        RunnerEventPayload::ProviderError {
            message: String::new(),
            fatal: false,
        },
        RunnerEventPayload::UsageTick {
            metrics: UsageMetrics::default(),
        },
    ];
    assert_eq!(payloads.len(), RunnerEventKind::ALL.len());
    for (payload, kind) in payloads.into_iter().zip(RunnerEventKind::ALL) {
        assert_eq!(payload.kind(), kind);
        let value = envelope(payload, None);
        assert_eq!(value["type"], kind.as_str());
    }
}

#[test]
fn events_deserialize_from_wire_form() {
    let raw = r#"{"type":"SESSION_ENDED","outcome":"COMPLETED","usage":{"agentSeconds":1.5,"terminalKb":0.5,"filesTouched":1,"commandsRun":0,"approvalsRequested":0},"sessionId":"s","orgId":"o","ts":"2024-05-01T12:00:00Z","seq":9}"#;
    let event: RunnerEvent = serde_json::from_str(raw).expect("deserialize");
    assert_eq!(event.kind(), RunnerEventKind::SessionEnded);
    assert!(event.is_critical());
    assert_eq!(event.seq, 9);
    assert_eq!(event.repo_ref, None);
}
