use agent_runner::models::approval::{ApprovalCategory, ApprovalDecision, ApprovalRequest, RiskLevel};
use agent_runner::models::event::{RunnerEventKind, SessionOutcome, UsageMetrics};
use agent_runner::models::policy::{DenyAction, DenyBehavior};
use agent_runner::models::session::SessionState;

#[test]
fn kinds_have_unique_wire_names() {
    let mut names: Vec<&str> = RunnerEventKind::ALL.iter().map(|k| k.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), RunnerEventKind::ALL.len());
}

#[test]
fn lifecycle_approval_and_billing_events_are_critical() {
    let critical: Vec<&str> = RunnerEventKind::ALL
        .iter()
        .filter(|k| k.is_critical())
        .map(|k| k.as_str())
        .collect();
    assert_eq!(
        critical,
        vec![
            "SESSION_STATE_CHANGED",
            "SESSION_STARTED",
            "SESSION_ENDED",
            "APPROVAL_REQUESTED",
            "APPROVAL_RESOLVED",
            "USAGE_TICK",
        ]
    );
}

#[test]
fn outcome_maps_to_terminal_state() {
    assert_eq!(SessionOutcome::Completed.state(), SessionState::Completed);
    assert_eq!(SessionOutcome::Failed.state(), SessionState::Failed);
}

#[test]
fn usage_accumulates() {
    let mut total = UsageMetrics::default();
    assert!(total.is_empty());
    total += UsageMetrics {
        agent_seconds: 1.5,
        terminal_kb: 2.0,
        files_touched: 1,
        commands_run: 2,
        approvals_requested: 0,
    };
    total += UsageMetrics {
        commands_run: 1,
        approvals_requested: 1,
        ..UsageMetrics::default()
    };
    assert!(!total.is_empty());
    assert_eq!(total.commands_run, 3);
    assert_eq!(total.approvals_requested, 1);
    assert!((total.agent_seconds - 1.5).abs() < f64::EPSILON);
}

#[test]
fn approval_keeps_provider_id_or_generates_one() {
    let kept = ApprovalRequest::new(
        Some("ap-1".into()),
        "sess-1".into(),
        ApprovalCategory::GitPush,
        RiskLevel::High,
        "push".into(),
    );
    assert_eq!(kept.id, "ap-1");
    assert!(kept.decision.is_none());

    let mut generated = ApprovalRequest::new(
        None,
        "sess-1".into(),
        ApprovalCategory::Other,
        RiskLevel::Low,
        "?".into(),
    );
    assert!(uuid::Uuid::parse_str(&generated.id).is_ok());

    generated.resolve(ApprovalDecision::Denied);
    assert_eq!(generated.decision, Some(ApprovalDecision::Denied));
    assert!(generated.resolved_at.is_some());
}

#[test]
fn default_risk_follows_category() {
    assert_eq!(ApprovalCategory::FileWrite.default_risk(), RiskLevel::Low);
    assert_eq!(ApprovalCategory::GitCommit.default_risk(), RiskLevel::Medium);
    assert_eq!(ApprovalCategory::GitPush.default_risk(), RiskLevel::High);
    assert_eq!(ApprovalCategory::FileDelete.default_risk(), RiskLevel::High);
}

#[test]
fn deny_behavior_resolution_order() {
    let behavior = DenyBehavior {
        default: DenyAction::Resume,
        categories: [(ApprovalCategory::DependencyInstall, DenyAction::Stop)]
            .into_iter()
            .collect(),
        stop_at_risk: Some(RiskLevel::Critical),
    };
    assert_eq!(
        behavior.action_for(ApprovalCategory::FileWrite, RiskLevel::Low),
        DenyAction::Resume
    );
    assert_eq!(
        behavior.action_for(ApprovalCategory::DependencyInstall, RiskLevel::Low),
        DenyAction::Stop
    );
    assert_eq!(
        behavior.action_for(ApprovalCategory::FileWrite, RiskLevel::Critical),
        DenyAction::Stop
    );
}
