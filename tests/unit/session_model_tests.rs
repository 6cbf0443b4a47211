use agent_runner::models::session::{SessionConfig, SessionState};
use agent_runner::AppError;

fn config() -> SessionConfig {
    serde_json::from_str(
        r#"{"sessionId":"sess-1","orgId":"org-1","providerId":"claude-code","task":"fix it"}"#,
    )
    .expect("minimal config")
}

#[test]
fn happy_path_transitions_are_allowed() {
    use SessionState::*;
    let path = [Created, PreparingWorkspace, StartingProvider, Running];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
    assert!(Running.can_transition_to(WaitingForApproval));
    assert!(WaitingForApproval.can_transition_to(Running));
    assert!(Running.can_transition_to(PausedByHuman));
    assert!(PausedByHuman.can_transition_to(Running));
    assert!(Stopping.can_transition_to(Completed));
    assert!(Stopping.can_transition_to(Failed));
}

#[test]
fn every_live_state_may_stop() {
    for state in SessionState::ALL {
        let expected = !state.is_terminal() && state != SessionState::Stopping;
        assert_eq!(
            state.can_transition_to(SessionState::Stopping),
            expected,
            "{state}"
        );
    }
}

#[test]
fn skips_and_terminal_exits_are_rejected() {
    use SessionState::*;
    assert!(!Created.can_transition_to(Running));
    assert!(!PreparingWorkspace.can_transition_to(Running));
    assert!(!Running.can_transition_to(Completed));
    assert!(!PausedByHuman.can_transition_to(WaitingForApproval));
    assert!(!WaitingForApproval.can_transition_to(PausedByHuman));
    for terminal in [Completed, Failed] {
        for next in SessionState::ALL {
            assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
        }
    }
}

#[test]
fn only_completed_and_failed_are_terminal() {
    let terminal: Vec<SessionState> = SessionState::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
    assert_eq!(terminal, vec![SessionState::Completed, SessionState::Failed]);
}

#[test]
fn wire_names_match_serde() {
    for state in SessionState::ALL {
        let json = serde_json::to_value(state).expect("serialize");
        assert_eq!(json, state.as_str());
        assert_eq!(state.to_string(), state.as_str());
    }
}

#[test]
fn minimal_config_gets_defaults() {
    let config = config();
    assert!(config.validate().is_ok());
    assert_eq!(config.repo_ref(), None);
    assert!(config.policy.shell_deny.is_empty());
    assert_eq!(config.billing.max_agent_seconds, None);
    assert_eq!(config.checkout.branch, None);
}

#[test]
fn blank_fields_fail_validation() {
    let blanks: [fn(&mut SessionConfig); 4] = [
        |c| c.session_id = String::new(),
        |c| c.org_id = "  ".into(),
        |c| c.provider_id = String::new(),
        |c| c.task = "\n".into(),
    ];
    for blank in blanks {
        let mut config = config();
        blank(&mut config);
        let err = config.validate().expect_err("blank field");
        assert!(matches!(err, AppError::Validation(_)), "{err}");
    }
}

#[test]
fn repo_ref_is_exposed_when_set() {
    let mut config = config();
    config.repo_ref = "acme/widgets".into();
    assert_eq!(config.repo_ref().as_deref(), Some("acme/widgets"));
}
