//! Claude Code profile.
//!
//! Non-interactive sessions run `claude -p <prompt> --output-format
//! stream-json --verbose`. Each stdout line is then one JSON message;
//! `tool_use` blocks inside assistant messages map to events:
//!
//! | Tool                 | Events                                  |
//! |----------------------|-----------------------------------------|
//! | `Read`               | files touched (`read`)                  |
//! | `Write`              | files touched (`write`)                 |
//! | `Edit`, `MultiEdit`  | files touched (`write`) + diff hint     |
//! | `Bash`               | tool request with classified command    |
//! | *(other)*            | tool request, category `other`          |
//!
//! A `result` message with `is_error: true` becomes a non-fatal error.

use serde_json::Value;

use crate::instrumentation::diff_summary::{diff_hint, DiffStats};
use crate::models::approval::{ApprovalCategory, ApprovalDecision};
use crate::policy::classify_command;
use crate::provider::base::{render_prompt, ProviderProfile};
use crate::provider::{FileOperation, ProviderCapabilities, ProviderEvent, StartArgs};

/// Provider id.
pub const PROVIDER_ID: &str = "claude-code";

/// Profile for the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeProfile {
    binary: String,
}

impl ClaudeCodeProfile {
    /// Profile launching `binary` (defaults to `claude`).
    #[must_use]
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "claude".into()),
        }
    }
}

impl Default for ClaudeCodeProfile {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProviderProfile for ClaudeCodeProfile {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn build_args(&self, args: &StartArgs, caps: &ProviderCapabilities) -> Vec<String> {
        let prompt = render_prompt(&args.task, &args.policy);
        let mut argv = Vec::new();
        if caps.non_interactive {
            argv.push("-p".into());
            argv.push(prompt);
            if caps.json_output {
                argv.extend(["--output-format".into(), "stream-json".into(), "--verbose".into()]);
            }
        } else {
            argv.push(prompt);
        }
        argv
    }

    fn json_mode(&self, caps: &ProviderCapabilities) -> bool {
        caps.non_interactive && caps.json_output
    }

    fn parse_json_line(&self, value: &Value) -> Vec<ProviderEvent> {
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| blocks.iter().flat_map(tool_use_events).collect())
                .unwrap_or_default(),
            Some("result") if value.get("is_error").and_then(Value::as_bool) == Some(true) => {
                let message = value
                    .get("result")
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

    fn approval_reply(&self, _approval_id: &str, decision: ApprovalDecision) -> Option<String> {
        match decision {
            ApprovalDecision::Approved => Some("y\n".into()),
            ApprovalDecision::Denied | ApprovalDecision::Cancelled => Some("n\n".into()),
        }
    }
}

fn tool_use_events(block: &Value) -> Vec<ProviderEvent> {
    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
        return Vec::new();
    }
    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
    let input = block.get("input").unwrap_or(&Value::Null);
    let file_path = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str);
    let str_field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or_default();

    match (name, file_path) {
        ("Read", Some(path)) => vec![touched(path, FileOperation::Read)],
        ("Write", Some(path)) => vec![touched(path, FileOperation::Write)],
        ("Edit", Some(path)) => {
            let stats = DiffStats::between(str_field("old_string"), str_field("new_string"));
            vec![touched(path, FileOperation::Write), diff_hint(Some(path), stats)]
        }
        ("MultiEdit", Some(path)) => {
            let mut stats = DiffStats::default();
            for edit in input
                .get("edits")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                let old = edit.get("old_string").and_then(Value::as_str).unwrap_or_default();
                let new = edit.get("new_string").and_then(Value::as_str).unwrap_or_default();
                stats.add(DiffStats::between(old, new));
            }
            vec![touched(path, FileOperation::Write), diff_hint(Some(path), stats)]
        }
        ("Bash", _) => {
            let command = str_field("command").to_owned();
            vec![ProviderEvent::ToolRequest {
                tool: name.to_owned(),
                category: classify_command(&command),
                command: Some(command),
            }]
        }
        ("", _) => Vec::new(),
        (other, _) => vec![ProviderEvent::ToolRequest {
            tool: other.to_owned(),
            command: None,
            category: ApprovalCategory::Other,
        }],
    }
}

fn touched(path: &str, operation: FileOperation) -> ProviderEvent {
    ProviderEvent::FilesTouched {
        paths: vec![path.to_owned()],
        operation,
    }
}
