//! Shared CLI adapter implementation.
//!
//! [`CliAdapter`] implements the whole [`ProviderAdapter`] contract once;
//! a [`ProviderProfile`] supplies the provider-specific parts (binary,
//! argument rendering and machine-readable line mapping).
//!
//! Output handling per line:
//! 1. ANSI escapes are stripped.
//! 2. If the profile's JSON mode is active and the line parses as JSON, the
//!    profile maps it to events.
//! 3. Otherwise the text heuristics in [`parse`](crate::provider::parse) run.
//!
//! File paths in the resulting events are relativised against the
//! workspace; paths that escape it are dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::approval::ApprovalDecision;
use crate::models::policy::{NetworkMode, PolicySpec};
use crate::provider::parse::{self, LineBuffer, Utf8Decoder};
use crate::provider::{
    DetectResult, EventListener, ProviderAdapter, ProviderCapabilities, ProviderEvent, StartArgs,
    SubscriptionId, Subscribers,
};
use crate::pty::{OutputStream, PtyEvent, PtyManager, Signal, SpawnRequest};
use crate::workspace::path_safety::relativize;
use crate::{AppError, BoxFuture, Result};

/// Upper bound for `--version` / `--help` probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace window between terminate and kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Provider-specific behaviour plugged into [`CliAdapter`].
pub trait ProviderProfile: Send + Sync + 'static {
    /// Provider id.
    fn provider_id(&self) -> &str;

    /// Executable name or path.
    fn binary(&self) -> &str;

    /// Arguments printing the version.
    fn version_args(&self) -> Vec<String> {
        vec!["--version".into()]
    }

    /// Arguments printing help text for capability probing.
    fn help_args(&self) -> Vec<String> {
        vec!["--help".into()]
    }

    /// Capabilities derived from help output.
    fn capabilities_from_help(&self, help: &str) -> ProviderCapabilities {
        parse::parse_capabilities(help)
    }

    /// Render the process arguments for a session.
    fn build_args(&self, args: &StartArgs, caps: &ProviderCapabilities) -> Vec<String>;

    /// Whether output lines should be parsed as JSON first.
    fn json_mode(&self, _caps: &ProviderCapabilities) -> bool {
        false
    }

    /// Map one parsed JSON line to events.
    fn parse_json_line(&self, _value: &serde_json::Value) -> Vec<ProviderEvent> {
        Vec::new()
    }

    /// Terminal input answering an approval prompt.
    fn approval_reply(&self, _approval_id: &str, _decision: ApprovalDecision) -> Option<String> {
        None
    }
}

/// Render the task and policy into a structured prompt.
#[must_use]
pub fn render_prompt(task: &str, policy: &PolicySpec) -> String {
    let mut prompt = format!("Task:\n{}\n", task.trim());

    let mut rules = Vec::new();
    if !policy.shell_deny.is_empty() {
        rules.push(format!(
            "Never run commands matching: {}",
            policy.shell_deny.join(", ")
        ));
    }
    if !policy.denied_paths.is_empty() {
        rules.push(format!(
            "Never modify files matching: {}",
            policy.denied_paths.join(", ")
        ));
    }
    match policy.network_mode {
        NetworkMode::Offline => rules.push("Do not access the network.".into()),
        NetworkMode::Restricted => {
            rules.push("Ask before accessing the network.".into());
        }
        NetworkMode::Full => {}
    }
    if !policy.approval_required.is_empty() {
        let categories: Vec<String> = policy
            .approval_required
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        rules.push(format!("Ask for approval before: {}", categories.join(", ")));
    }

    if !rules.is_empty() {
        prompt.push_str("\nConstraints:\n");
        for rule in rules {
            prompt.push_str("- ");
            prompt.push_str(&rule);
            prompt.push('\n');
        }
    }
    prompt
}

/// Parse one complete output line into events.
#[must_use]
pub fn parse_line<P: ProviderProfile + ?Sized>(profile: &P, line: &str, json_mode: bool) -> Vec<ProviderEvent> {
    let clean = parse::strip_ansi(line);
    let trimmed = clean.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if json_mode && trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            return profile.parse_json_line(&value);
        }
        debug!("line looked like json but failed to parse, using heuristics");
    }
    parse::heuristic_events(trimmed)
}

/// Relativise file paths in `event` against `root`.
///
/// Returns `None` when every path escaped the workspace.
#[must_use]
pub fn scope_event(root: &Path, event: ProviderEvent) -> Option<ProviderEvent> {
    match event {
        ProviderEvent::FilesTouched { paths, operation } => {
            let paths: Vec<String> = paths.iter().filter_map(|p| relativize(root, p)).collect();
            (!paths.is_empty()).then_some(ProviderEvent::FilesTouched { paths, operation })
        }
        ProviderEvent::DiffHint {
            path: Some(path),
            additions,
            deletions,
            summary,
        } => relativize(root, &path).map(|path| ProviderEvent::DiffHint {
            path: Some(path),
            additions,
            deletions,
            summary,
        }),
        other => Some(other),
    }
}

struct ActiveSession {
    session_id: String,
    exited: watch::Receiver<bool>,
}

struct Shared<P> {
    profile: P,
    pty: Arc<dyn PtyManager>,
    subscribers: Subscribers<ProviderEvent>,
    capabilities: OnceCell<ProviderCapabilities>,
    version: OnceCell<Option<String>>,
    session: Mutex<Option<ActiveSession>>,
    stop_requested: AtomicBool,
    extra_args: Vec<String>,
    stop_grace: Duration,
}

/// [`ProviderAdapter`] for a command-line provider.
pub struct CliAdapter<P: ProviderProfile> {
    shared: Arc<Shared<P>>,
}

impl<P: ProviderProfile> CliAdapter<P> {
    /// Create an adapter spawning through `pty`.
    #[must_use]
    pub fn new(profile: P, pty: Arc<dyn PtyManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                profile,
                pty,
                subscribers: Subscribers::new(),
                capabilities: OnceCell::new(),
                version: OnceCell::new(),
                session: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                extra_args: Vec::new(),
                stop_grace: DEFAULT_STOP_GRACE,
            }),
        }
    }

    /// Append arguments after the rendered ones.
    #[must_use]
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.extra_args = extra_args;
        }
        self
    }

    /// Override the grace window between terminate and kill.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.stop_grace = grace;
        }
        self
    }

    /// Profile backing this adapter.
    #[must_use]
    pub fn profile(&self) -> &P {
        &self.shared.profile
    }

    async fn detect_inner(&self) -> DetectResult {
        let profile = &self.shared.profile;
        let binary = profile.binary();
        let path = which::which(binary).ok();

        match probe(binary, &profile.version_args()).await {
            Some(output) => {
                let version = parse::parse_version(&output);
                let _ = self.shared.version.set(Some(version.clone()));
                DetectResult {
                    installed: true,
                    version: Some(version),
                    path,
                }
            }
            None => DetectResult {
                installed: path.is_some(),
                version: None,
                path,
            },
        }
    }

    async fn capabilities_inner(&self) -> ProviderCapabilities {
        *self
            .shared
            .capabilities
            .get_or_init(|| async {
                let profile = &self.shared.profile;
                match probe(profile.binary(), &profile.help_args()).await {
                    Some(help) => profile.capabilities_from_help(&help),
                    None => {
                        warn!(provider = profile.provider_id(), "help probe failed, assuming no optional capabilities");
                        ProviderCapabilities::default()
                    }
                }
            })
            .await
    }

    async fn start_inner(&self, args: StartArgs) -> Result<u32> {
        let caps = self.capabilities_inner().await;
        let shared = &self.shared;

        let mut slot = shared.session.lock().await;
        if slot.as_ref().is_some_and(|s| !*s.exited.borrow()) {
            return Err(AppError::Adapter("Session already active".into()));
        }

        let mut argv = shared.profile.build_args(&args, &caps);
        argv.extend(shared.extra_args.iter().cloned());

        let request = SpawnRequest {
            command: shared.profile.binary().to_owned(),
            args: argv,
            cwd: args.repo_path.clone(),
            env: args.env.clone(),
        };
        let process = shared.pty.spawn(&args.session_id, request).await?;
        let pid = process.pid;

        let (exit_tx, exit_rx) = watch::channel(false);
        *slot = Some(ActiveSession {
            session_id: args.session_id.clone(),
            exited: exit_rx,
        });
        shared.stop_requested.store(false, Ordering::SeqCst);
        drop(slot);

        let version = shared.version.get().cloned().flatten();
        shared.subscribers.emit(&ProviderEvent::Started { pid, version });

        let json_mode = shared.profile.json_mode(&caps);
        let span = info_span!(
            "provider_output",
            provider = shared.profile.provider_id(),
            session_id = %args.session_id,
        );
        tokio::spawn(
            pump_output(
                Arc::clone(shared),
                process.events,
                exit_tx,
                args.repo_path,
                json_mode,
            )
            .instrument(span),
        );

        info!(pid, provider = shared.profile.provider_id(), "provider session started");
        Ok(pid)
    }

    async fn send_input_inner(&self, data: &str) -> Result<()> {
        let session_id = {
            let slot = self.shared.session.lock().await;
            match slot.as_ref() {
                Some(active) if !*active.exited.borrow() => active.session_id.clone(),
                _ => return Err(AppError::Adapter("no active provider session".into())),
            }
        };
        self.shared.pty.write(&session_id, data.as_bytes()).await
    }

    async fn stop_inner(&self) -> Result<()> {
        let shared = &self.shared;
        let (session_id, mut exited) = {
            let slot = shared.session.lock().await;
            match slot.as_ref() {
                Some(active) => (active.session_id.clone(), active.exited.clone()),
                None => return Ok(()),
            }
        };
        if *exited.borrow() {
            return Ok(());
        }

        shared.stop_requested.store(true, Ordering::SeqCst);
        shared.pty.kill(&session_id, Signal::Terminate).await?;

        if !wait_exited(&mut exited, shared.stop_grace).await {
            warn!(session_id, "provider ignored terminate signal, killing");
            shared.pty.kill(&session_id, Signal::Kill).await?;
            if !wait_exited(&mut exited, shared.stop_grace).await {
                warn!(session_id, "provider did not report exit after kill");
            }
        }
        Ok(())
    }
}

/// Wait until the output pump reports exit. A dropped sender counts as
/// exited.
async fn wait_exited(exited: &mut watch::Receiver<bool>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, exited.wait_for(|done| *done)).await {
        Ok(result) => {
            drop(result);
            true
        }
        Err(_) => false,
    }
}

/// Run a probe command and return its combined output, or `None` when it
/// cannot run or times out.
async fn probe(binary: &str, args: &[String]) -> Option<String> {
    let run = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(PROBE_TIMEOUT, run).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.success() || !text.trim().is_empty()).then_some(text)
        }
        Ok(Err(err)) => {
            debug!(binary, %err, "probe failed to run");
            None
        }
        Err(_) => {
            warn!(binary, "probe timed out");
            None
        }
    }
}

async fn pump_output<P: ProviderProfile>(
    shared: Arc<Shared<P>>,
    mut events: mpsc::Receiver<PtyEvent>,
    exit_tx: watch::Sender<bool>,
    root: PathBuf,
    json_mode: bool,
) {
    let mut stdout = (Utf8Decoder::default(), LineBuffer::default());
    let mut stderr = (Utf8Decoder::default(), LineBuffer::default());
    let mut exit_code = None;

    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Data { stream, data, .. } => {
                let (decoder, lines) = match stream {
                    OutputStream::Stdout => &mut stdout,
                    OutputStream::Stderr => &mut stderr,
                };
                let text = decoder.decode(&data);
                if text.is_empty() {
                    continue;
                }
                let lines = lines.push(&text);
                shared.subscribers.emit(&ProviderEvent::Message { stream, text });
                for line in lines {
                    emit_line(&shared, &root, &line, json_mode);
                }
            }
            PtyEvent::Exit { exit_code: code, .. } => {
                exit_code = code;
                break;
            }
        }
    }

    let streams = [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)];
    for (stream, (mut decoder, mut lines)) in streams {
        let text = decoder.finish();
        let mut complete = Vec::new();
        if !text.is_empty() {
            complete = lines.push(&text);
            shared.subscribers.emit(&ProviderEvent::Message { stream, text });
        }
        complete.extend(lines.flush());
        for line in complete {
            emit_line(&shared, &root, &line, json_mode);
        }
    }

    let _ = exit_tx.send(true);

    let reason = if shared.stop_requested.load(Ordering::SeqCst) {
        "stopped by runner".to_owned()
    } else {
        exit_code.map_or_else(
            || "process terminated by signal".to_owned(),
            |c| format!("process exited with code {c}"),
        )
    };
    shared
        .subscribers
        .emit(&ProviderEvent::Stopped { exit_code, reason });
}

fn emit_line<P: ProviderProfile>(shared: &Shared<P>, root: &Path, line: &str, json_mode: bool) {
    for event in parse_line(&shared.profile, line, json_mode) {
        if let Some(event) = scope_event(root, event) {
            shared.subscribers.emit(&event);
        }
    }
}

impl<P: ProviderProfile> ProviderAdapter for CliAdapter<P> {
    fn provider_id(&self) -> &str {
        self.shared.profile.provider_id()
    }

    fn detect(&self) -> BoxFuture<'_, DetectResult> {
        Box::pin(self.detect_inner())
    }

    fn capabilities(&self) -> BoxFuture<'_, ProviderCapabilities> {
        Box::pin(self.capabilities_inner())
    }

    fn start_session(&self, args: StartArgs) -> BoxFuture<'_, Result<u32>> {
        Box::pin(self.start_inner(args))
    }

    fn send_input<'a>(&'a self, data: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_input_inner(data))
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.stop_inner())
    }

    fn on_event(&self, listener: EventListener) -> SubscriptionId {
        self.shared.subscribers.subscribe(listener)
    }

    fn off_event(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    fn approval_reply(&self, approval_id: &str, decision: ApprovalDecision) -> Option<String> {
        self.shared.profile.approval_reply(approval_id, decision)
    }
}
