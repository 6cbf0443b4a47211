//! Pure text → event helpers shared by provider profiles.
//!
//! Everything here is side-effect free so it can be tested without
//! spawning processes. Heuristics are tolerant of false negatives and
//! avoid synthesising approval requests from ordinary prose.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::models::approval::ApprovalCategory;
use crate::policy::classify_command;
use crate::provider::{FileOperation, PrFlowDepth, ProviderCapabilities, ProviderEvent};
use crate::stream::codec::MAX_LINE_BYTES;

/// Fallback when no version pattern matches.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Remove ANSI escape sequences.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    strip_ansi_escapes::strip_str(text)
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

// ── Version / capability probing ─────────────────────────────────────────────

fn version_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            r"(?i)\bversion\s*:?\s*v?(\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?)",
            r"\bv?(\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?)\b",
            r"\bv?(\d+\.\d+)\b",
        ])
    })
}

/// Extract a version from `--version` output.
///
/// Patterns are tried in priority order; [`UNKNOWN_VERSION`] when none
/// match.
#[must_use]
pub fn parse_version(output: &str) -> String {
    let clean = strip_ansi(output);
    version_patterns()
        .iter()
        .find_map(|re| re.captures(&clean).and_then(|c| c.get(1)))
        .map_or_else(|| UNKNOWN_VERSION.to_owned(), |m| m.as_str().to_owned())
}

/// Derive capabilities from `--help` output.
#[must_use]
pub fn parse_capabilities(help: &str) -> ProviderCapabilities {
    let help = strip_ansi(help);
    let lower = help.to_lowercase();
    let has = |needle: &str| lower.contains(needle);
    // Whole flags only, so `--pr` does not match `--print`.
    let flags: HashSet<&str> = lower
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '=' | '[' | ']' | '<' | '>' | '(' | ')'))
        .filter(|token| token.starts_with("--"))
        .collect();
    let flag = |name: &str| flags.contains(name);

    let pr_flow = if has("pull request") || flag("--pr") || has("create-pr") {
        PrFlowDepth::PullRequest
    } else if flag("--branch") || has("commit") {
        PrFlowDepth::Branch
    } else {
        PrFlowDepth::None
    };

    ProviderCapabilities {
        non_interactive: flag("--print") || flag("--non-interactive") || flag("--headless"),
        json_output: flag("--output-format") || flag("--json") || has("stream-json"),
        mcp: has("mcp"),
        resume: flag("--resume") || flag("--continue"),
        pr_flow,
    }
}

// ── Output heuristics ────────────────────────────────────────────────────────

const PATH_PATTERN: &str = r#"[`'"]?((?:\.{0,2}/)?[\w@.\-]+(?:/[\w@.\-]+)*\.[A-Za-z0-9]{1,8})[`'"]?"#;

fn file_patterns() -> &'static [(Regex, FileOperation)] {
    static PATTERNS: OnceLock<Vec<(Regex, FileOperation)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)\b(?:reading|read|viewing|opened|opening)\s+(?:file\s+)?", FileOperation::Read),
            (r"(?i)\b(?:creating|created)\s+(?:new\s+)?(?:file\s+)?", FileOperation::Create),
            (
                r"(?i)\b(?:writing|wrote|editing|edited|updating|updated|modifying|modified)\s+(?:to\s+)?(?:file\s+)?",
                FileOperation::Write,
            ),
            (r"(?i)\b(?:deleting|deleted|removing|removed)\s+(?:file\s+)?", FileOperation::Delete),
        ]
        .into_iter()
        .filter_map(|(verb, op)| Regex::new(&format!("{verb}{PATH_PATTERN}")).ok().map(|re| (re, op)))
        .collect()
    })
}

fn command_prefix() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&[r"(?i)^\s*(?:\$|❯|>|running:?|executing:?|run:)\s+(.+)$"]))
}

fn approval_prompt() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            r"(?i)\b(?:do you want to|allow|approve|proceed with|permit)\b.*\?\s*(?:\[y/n\]|\(y/n\)|\[Y/n\]|\[y/N\])",
            r"(?i)\b(?:requires|needs) (?:your )?(?:approval|permission)\b",
        ])
    })
}

fn error_line() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&[r"^(?:error|fatal):\s*(.+)$", r"^Error:\s*(.+)$"]))
}

/// Commands that start with one of these tokens are eligible for
/// command heuristics.
const COMMAND_TOKENS: &[&str] = &[
    "git", "npm", "yarn", "pnpm", "pip", "pip3", "cargo", "go", "gem", "bundle",
];

/// Best-effort events from one line of non-JSON output.
#[must_use]
pub fn heuristic_events(line: &str) -> Vec<ProviderEvent> {
    let clean = strip_ansi(line);
    let text = clean.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut events = Vec::new();

    if approval_prompt().iter().any(|re| re.is_match(text)) {
        let category = classify_prompt(text);
        events.push(ProviderEvent::RequestApproval {
            approval_id: None,
            category,
            risk: category.default_risk(),
            summary: text.to_owned(),
        });
        return events;
    }

    if let Some(command) = extract_command(text) {
        let category = classify_command(&command);
        if matches!(
            category,
            ApprovalCategory::GitPush | ApprovalCategory::GitCommit | ApprovalCategory::DependencyInstall
        ) {
            events.push(ProviderEvent::ToolRequest {
                tool: "shell".into(),
                command: Some(command),
                category,
            });
            return events;
        }
    }

    for (re, operation) in file_patterns() {
        let paths: Vec<String> = re
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .filter(|p| !looks_like_url_or_version(p))
            .collect();
        if !paths.is_empty() {
            events.push(ProviderEvent::FilesTouched {
                paths,
                operation: *operation,
            });
        }
    }

    if events.is_empty() {
        if let Some(message) = error_line()
            .iter()
            .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        {
            events.push(ProviderEvent::Error {
                message: message.as_str().trim().to_owned(),
                fatal: false,
            });
        }
    }

    events
}

/// A shell command at the start of a line, with or without a prompt prefix.
fn extract_command(text: &str) -> Option<String> {
    let candidate = command_prefix()
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map_or(text, |m| m.as_str())
        .trim();
    let first = candidate.split_whitespace().next()?;
    COMMAND_TOKENS
        .contains(&first)
        .then(|| candidate.to_owned())
}

fn classify_prompt(text: &str) -> ApprovalCategory {
    let lower = text.to_lowercase();
    if let Some(command) = extract_command(text) {
        return classify_command(&command);
    }
    if lower.contains("git push") || lower.contains("push to") {
        ApprovalCategory::GitPush
    } else if lower.contains("commit") {
        ApprovalCategory::GitCommit
    } else if lower.contains("install") {
        ApprovalCategory::DependencyInstall
    } else if lower.contains("delete") || lower.contains("remove") {
        ApprovalCategory::FileDelete
    } else if lower.contains("write") || lower.contains("edit") || lower.contains("create") {
        ApprovalCategory::FileWrite
    } else if lower.contains("run") || lower.contains("execute") || lower.contains("command") {
        ApprovalCategory::ShellCommand
    } else {
        ApprovalCategory::Other
    }
}

fn looks_like_url_or_version(candidate: &str) -> bool {
    candidate.contains("://")
        || candidate.starts_with("www.")
        || candidate
            .trim_start_matches('v')
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
}

// ── Line buffering ───────────────────────────────────────────────────────────

/// Decodes a byte stream as UTF-8 across chunk boundaries.
///
/// An incomplete trailing sequence is held back until the next chunk;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    tail: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode every complete code point available after appending `chunk`.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.tail.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.tail.len());
        let mut rest = self.tail.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.tail = rest.to_vec();
        out
    }

    /// Decode whatever is left, replacing a truncated sequence.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.tail);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Splits decoded text into complete lines.
///
/// A partial line longer than [`MAX_LINE_BYTES`] is emitted as is.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append `chunk` and return every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(idx) = rest.find('\n') {
            self.pending.push_str(&rest[..idx]);
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
            rest = &rest[idx + 1..];
        }
        self.pending.push_str(rest);

        if self.pending.len() > MAX_LINE_BYTES {
            warn!(bytes = self.pending.len(), "provider line exceeds limit, emitting partial line");
            lines.push(std::mem::take(&mut self.pending));
        }
        lines
    }

    /// Return the trailing partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
