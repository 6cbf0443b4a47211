use agent_runner::AppError;

#[test]
fn display_prefixes_name_the_failure_mode() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Validation("x".into()), "validation: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::AlreadyExists("x".into()), "already exists: x"),
        (AppError::NotInitialized("x".into()), "not initialized: x"),
        (AppError::Capacity("x".into()), "capacity: x"),
        (AppError::InvalidTransition("x".into()), "invalid transition: x"),
        (AppError::Adapter("x".into()), "adapter: x"),
        (AppError::Workspace("x".into()), "workspace: x"),
        (AppError::Transport("x".into()), "transport: x"),
        (AppError::PolicyViolation("x".into()), "policy violation: x"),
        (AppError::PathViolation("x".into()), "path violation: x"),
        (AppError::Ipc("x".into()), "ipc: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn json_errors_become_validation_errors() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("bad json")
        .into();
    assert!(matches!(err, AppError::Validation(ref msg) if msg.starts_with("invalid json")));
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= 1").expect_err("bad toml").into();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn io_errors_are_wrapped() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert_eq!(err.to_string(), "io: gone");
}
