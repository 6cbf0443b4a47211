use agent_runner::models::approval::ApprovalDecision;
use agent_runner::models::command::SessionCommand;
use agent_runner::AppError;

#[test]
fn parses_every_command() {
    let cases = [
        (
            r#"{"type":"START","config":{"sessionId":"s","orgId":"o","providerId":"codex","task":"t"}}"#,
            "START",
        ),
        (r#"{"type":"INPUT","sessionId":"s","data":"ls\n"}"#, "INPUT"),
        (r#"{"type":"STOP","sessionId":"s"}"#, "STOP"),
        (r#"{"type":"PAUSE","sessionId":"s"}"#, "PAUSE"),
        (r#"{"type":"RESUME","sessionId":"s"}"#, "RESUME"),
        (
            r#"{"type":"APPROVE","sessionId":"s","approvalId":"a","decision":"approved"}"#,
            "APPROVE",
        ),
    ];
    for (raw, name) in cases {
        let command = SessionCommand::parse(raw).expect(name);
        assert_eq!(command.name(), name);
        assert_eq!(command.session_id(), "s");
    }
}

#[test]
fn stop_is_graceful_by_default() {
    let command = SessionCommand::parse(r#"{"type":"STOP","sessionId":"s"}"#).expect("stop");
    assert_eq!(
        command,
        SessionCommand::Stop {
            session_id: "s".into(),
            graceful: true,
        }
    );
}

#[test]
fn decision_aliases_are_accepted() {
    for (raw, expected) in [
        ("approve", ApprovalDecision::Approved),
        ("APPROVED", ApprovalDecision::Approved),
        ("deny", ApprovalDecision::Denied),
        ("denied", ApprovalDecision::Denied),
        ("cancel", ApprovalDecision::Cancelled),
    ] {
        let json = format!(
            r#"{{"type":"APPROVE","sessionId":"s","approvalId":"a","decision":"{raw}","note":"ok"}}"#
        );
        match SessionCommand::parse(&json).expect(raw) {
            SessionCommand::Approve { decision, note, .. } => {
                assert_eq!(decision, expected, "{raw}");
                assert_eq!(note.as_deref(), Some("ok"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn malformed_commands_are_validation_errors() {
    for raw in [
        "not json",
        r#"{"type":"REBOOT","sessionId":"s"}"#,
        r#"{"sessionId":"s"}"#,
        r#"{"type":"INPUT","sessionId":"s"}"#,
        r#"{"type":"PAUSE","sessionId":""}"#,
        r#"{"type":"APPROVE","sessionId":"s","approvalId":" ","decision":"approved"}"#,
        r#"{"type":"START","config":{"sessionId":"s","orgId":"o","providerId":"codex","task":""}}"#,
    ] {
        let err = SessionCommand::parse(raw).expect_err(raw);
        assert!(matches!(err, AppError::Validation(_)), "{raw}: {err}");
    }
}
