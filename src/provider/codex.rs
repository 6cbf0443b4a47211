//! Codex CLI profile.
//!
//! Runs `codex exec --json <prompt>` and maps the item stream:
//! `command_execution` items become tool requests when they start and
//! `file_change` items become files-touched hints when they complete.

use serde_json::Value;

use crate::policy::classify_command;
use crate::provider::base::{render_prompt, ProviderProfile};
use crate::provider::parse;
use crate::provider::{FileOperation, ProviderCapabilities, ProviderEvent, StartArgs};

/// Provider id.
pub const PROVIDER_ID: &str = "codex";

/// Profile for the `codex` CLI.
#[derive(Debug, Clone)]
pub struct CodexProfile {
    binary: String,
}

impl CodexProfile {
    /// Profile launching `binary` (defaults to `codex`).
    #[must_use]
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "codex".into()),
        }
    }
}

impl Default for CodexProfile {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProviderProfile for CodexProfile {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn help_args(&self) -> Vec<String> {
        vec!["exec".into(), "--help".into()]
    }

    fn capabilities_from_help(&self, help: &str) -> ProviderCapabilities {
        // `exec --help` only exists on builds with a non-interactive mode.
        let mut caps = parse::parse_capabilities(help);
        caps.non_interactive = !help.trim().is_empty();
        caps
    }

    fn build_args(&self, args: &StartArgs, caps: &ProviderCapabilities) -> Vec<String> {
        let prompt = render_prompt(&args.task, &args.policy);
        if !caps.non_interactive {
            return vec![prompt];
        }
        let mut argv = vec!["exec".to_owned()];
        if caps.json_output {
            argv.push("--json".into());
        }
        argv.push(prompt);
        argv
    }

    fn json_mode(&self, caps: &ProviderCapabilities) -> bool {
        caps.non_interactive && caps.json_output
    }

    fn parse_json_line(&self, value: &Value) -> Vec<ProviderEvent> {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let item = value.get("item").unwrap_or(&Value::Null);
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();

        match (kind, item_type) {
            ("item.started", "command_execution") => {
                let command = item
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                vec![ProviderEvent::ToolRequest {
                    tool: "shell".into(),
                    category: classify_command(&command),
                    command: Some(command),
                }]
            }
            ("item.completed", "file_change") => file_change_events(item),
            ("error", _) | ("turn.failed", _) => {
                let message = value
                    .get("message")
                    .or_else(|| value.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .unwrap_or("provider reported an error")
                    .to_owned();
                vec![ProviderEvent::Error {
                    message,
                    fatal: false,
                }]
            }
            _ => Vec::new(),
        }
    }
}

fn file_change_events(item: &Value) -> Vec<ProviderEvent> {
    let mut grouped: Vec<(FileOperation, Vec<String>)> = Vec::new();
    for change in item
        .get("changes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(path) = change.get("path").and_then(Value::as_str) else {
            continue;
        };
        let operation = match change.get("kind").and_then(Value::as_str) {
            Some("add") => FileOperation::Create,
            Some("delete") => FileOperation::Delete,
            _ => FileOperation::Write,
        };
        match grouped.iter_mut().find(|(op, _)| *op == operation) {
            Some((_, paths)) => paths.push(path.to_owned()),
            None => grouped.push((operation, vec![path.to_owned()])),
        }
    }
    grouped
        .into_iter()
        .map(|(operation, paths)| ProviderEvent::FilesTouched { paths, operation })
        .collect()
}
