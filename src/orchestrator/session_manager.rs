//! Session registry and per-session lifecycle.
//!
//! [`SessionManager`] exclusively owns every [`SessionRuntimeState`]. All
//! mutation happens under one registry mutex that is never held across an
//! `.await`, so each session has at most one transition in flight and
//! sequence numbers are assigned by a single writer.
//!
//! Runner events are delivered synchronously to listeners registered with
//! [`SessionManager::on_event`], in registration order, while the registry
//! lock is held. Listeners must hand events off (e.g. to a channel) and
//! must not call back into the manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RunnerConfig;
use crate::instrumentation::WorkspaceWatcher;
use crate::models::approval::{ApprovalCategory, ApprovalDecision, ApprovalRequest, RiskLevel};
use crate::models::event::{RunnerEvent, RunnerEventPayload, SessionOutcome};
use crate::models::policy::DenyAction;
use crate::models::session::{
    SessionConfig, SessionRuntimeState, SessionSnapshot, SessionState, SessionStats,
};
use crate::orchestrator::usage::UsageAccumulator;
use crate::policy::{PolicyEvaluator, Verdict};
use crate::provider::{
    FileOperation, Listener, ProviderEvent, SharedAdapter, StartArgs, SubscriptionId, Subscribers,
};
use crate::workspace::{WorkspaceManager, WorkspaceStatus};
use crate::{AppError, Result};

/// Tunables for [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    /// Maximum concurrently registered sessions.
    pub max_sessions: usize,
    /// Forced ungraceful stop after this long; `None` disables it.
    pub session_timeout: Option<Duration>,
    /// Usage tick period.
    pub usage_tick_interval: Duration,
    /// Bound on [`SessionManager::shutdown`].
    pub shutdown_timeout: Duration,
    /// Bound on each adapter `stop()` and workspace teardown.
    pub stop_timeout: Duration,
    /// Emit `TERMINAL_OUTPUT` for raw provider output.
    pub forward_terminal_output: bool,
    /// Watch workspaces for file changes.
    pub watch_workspace_files: bool,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_timeout: None,
            usage_tick_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            forward_terminal_output: true,
            watch_workspace_files: false,
        }
    }
}

impl SessionManagerOptions {
    /// Derive options from the runner configuration.
    #[must_use]
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_sessions: usize::try_from(config.max_sessions).unwrap_or(usize::MAX),
            session_timeout: config.session_timeout(),
            usage_tick_interval: config.usage_tick_interval(),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_seconds),
            stop_timeout: config.stop_grace() * 2 + Duration::from_secs(5),
            forward_terminal_output: config.forward_terminal_output,
            watch_workspace_files: config.watch_workspace_files,
        }
    }
}

// ── Internal state ──────────────────────────────────────────

#[derive(Debug, Clone)]
enum WorkspacePhase {
    Pending,
    Ready(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone)]
enum Ending {
    Completed(Option<String>),
    Failed(String),
}

impl Ending {
    fn outcome(&self) -> SessionOutcome {
        match self {
            Self::Completed(_) => SessionOutcome::Completed,
            Self::Failed(_) => SessionOutcome::Failed,
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::Completed(reason) => reason.clone(),
            Self::Failed(reason) => Some(reason.clone()),
        }
    }
}

enum Teardown {
    Wait(watch::Receiver<()>),
    Proceed((Option<SharedAdapter>, Option<SubscriptionId>)),
}

enum Lifecycle {
    Idle,
    Running(CancellationToken),
    ShutDown,
}

struct SessionEntry {
    config: SessionConfig,
    runtime: SessionRuntimeState,
    evaluator: PolicyEvaluator,
    adapter: Option<SharedAdapter>,
    subscription: Option<SubscriptionId>,
    provider_version: Option<String>,
    workspace: watch::Sender<WorkspacePhase>,
    // Dropped on purge; waiters on `stop_session` observe the close.
    ended: watch::Sender<()>,
    usage: UsageAccumulator,
    watcher: Option<WorkspaceWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionEntry {
    fn new(config: SessionConfig) -> Self {
        let evaluator = PolicyEvaluator::new(config.policy.clone());
        Self {
            config,
            runtime: SessionRuntimeState::new(),
            evaluator,
            adapter: None,
            subscription: None,
            provider_version: None,
            workspace: watch::channel(WorkspacePhase::Pending).0,
            ended: watch::channel(()).0,
            usage: UsageAccumulator::default(),
            watcher: None,
            tasks: Vec::new(),
        }
    }

    fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.config.session_id.clone(),
            org_id: self.config.org_id.clone(),
            provider_id: self.config.provider_id.clone(),
            runtime: self.runtime.clone(),
            usage: self.usage.snapshot(now),
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type Registry = HashMap<String, SessionEntry>;

struct ManagerInner {
    options: SessionManagerOptions,
    workspaces: Arc<dyn WorkspaceManager>,
    sessions: Mutex<Registry>,
    subscribers: Subscribers<RunnerEvent>,
    lifecycle: Mutex<Lifecycle>,
}

/// Registry plus per-session state machine.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager. Call [`SessionManager::init`] before starting
    /// sessions.
    #[must_use]
    pub fn new(options: SessionManagerOptions, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                options,
                workspaces,
                sessions: Mutex::new(HashMap::new()),
                subscribers: Subscribers::new(),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_sessions(&self) -> usize {
        self.inner.options.max_sessions
    }

    /// Start the usage ticker. Calling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotInitialized` after [`SessionManager::shutdown`].
    pub fn init(&self) -> Result<()> {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::ShutDown => {
                return Err(AppError::NotInitialized(
                    "session manager has been shut down".into(),
                ))
            }
            Lifecycle::Idle => {}
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run_usage_ticker(
            Arc::downgrade(&self.inner),
            self.inner.options.usage_tick_interval,
            cancel.clone(),
        ));
        *lifecycle = Lifecycle::Running(cancel);
        info!(
            max_sessions = self.inner.options.max_sessions,
            "session manager initialised"
        );
        Ok(())
    }

    /// Register a runner event listener.
    pub fn on_event(&self, listener: Listener<RunnerEvent>) -> SubscriptionId {
        self.inner.subscribers.subscribe(listener)
    }

    /// Remove a runner event listener.
    pub fn off_event(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    // ── Commands ────────────────────────────────────────────

    /// Register a session and begin workspace preparation.
    ///
    /// Returns once the session is in `PREPARING_WORKSPACE`; the checkout
    /// continues in the background.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for an incomplete config.
    /// - `AppError::NotInitialized` before [`SessionManager::init`].
    /// - `AppError::AlreadyExists` for a duplicate session id.
    /// - `AppError::Capacity` when `max_sessions` are already registered.
    pub fn start_session(&self, config: SessionConfig) -> Result<()> {
        let _span = info_span!("start_session", session_id = %config.session_id).entered();
        config.validate()?;
        self.ensure_running()?;

        let session_id = config.session_id.clone();
        {
            let mut sessions = self.inner.lock();
            if sessions.contains_key(&session_id) {
                return Err(AppError::AlreadyExists(format!(
                    "session {session_id} already exists"
                )));
            }
            let max = self.inner.options.max_sessions;
            if sessions.len() >= max {
                return Err(AppError::Capacity(format!(
                    "Maximum sessions exceeded ({}/{max})",
                    sessions.len()
                )));
            }

            let entry = sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionEntry::new(config));
            self.inner
                .transition(entry, SessionState::PreparingWorkspace, None)?;

            let prepare = tokio::spawn(
                prepare_workspace(Arc::downgrade(&self.inner), session_id.clone())
                    .instrument(info_span!("prepare_workspace", session_id = %session_id)),
            );
            entry.tasks.push(prepare);

            if let Some(limit) = self.inner.options.session_timeout {
                entry.tasks.push(tokio::spawn(session_timeout(
                    Arc::downgrade(&self.inner),
                    session_id.clone(),
                    limit,
                )));
            }
        }

        info!("session registered");
        Ok(())
    }

    /// Bind `adapter` to a session and launch the provider.
    ///
    /// Waits for the workspace, probes the adapter, subscribes to its
    /// events and starts it in the workspace directory.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown session.
    /// - `AppError::AlreadyExists` if an adapter is already bound.
    /// - `AppError::Workspace` when preparation failed.
    /// - `AppError::InvalidTransition` if the session left
    ///   `PREPARING_WORKSPACE` meanwhile.
    /// - The adapter's start error; the session is then failed.
    pub async fn set_provider_adapter(&self, session_id: &str, adapter: SharedAdapter) -> Result<()> {
        let span = info_span!("set_provider_adapter", session_id, provider = adapter.provider_id());
        async {
            let mut phase = {
                let mut sessions = self.inner.lock();
                let entry = get_entry(&mut sessions, session_id)?;
                if entry.adapter.is_some() {
                    return Err(AppError::AlreadyExists(format!(
                        "adapter already bound for session {session_id}"
                    )));
                }
                entry.adapter = Some(Arc::clone(&adapter));
                entry.workspace.subscribe()
            };

            let ready = phase
                .wait_for(|p| !matches!(p, WorkspacePhase::Pending))
                .await
                .map(|p| p.clone())
                .map_err(|_| AppError::NotFound(format!("session {session_id} not found")))?;
            let repo_path = match ready {
                WorkspacePhase::Ready(path) => path,
                WorkspacePhase::Failed(reason) => return Err(AppError::Workspace(reason)),
                WorkspacePhase::Pending => {
                    return Err(AppError::Workspace("workspace not ready".into()))
                }
            };

            let detected = adapter.detect().await;
            if !detected.installed {
                warn!("provider binary not detected, attempting start anyway");
            }
            let capabilities = adapter.capabilities().await;
            debug!(?capabilities, "provider capabilities");

            let args = {
                let mut sessions = self.inner.lock();
                let entry = get_entry(&mut sessions, session_id)?;
                self.inner
                    .transition(entry, SessionState::StartingProvider, None)?;
                entry.provider_version = detected.version.clone();

                let weak = Arc::downgrade(&self.inner);
                let id = session_id.to_owned();
                let listener: Listener<ProviderEvent> = Arc::new(move |event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_provider_event(&id, event);
                    }
                });
                entry.subscription = Some(adapter.on_event(listener));

                StartArgs {
                    session_id: session_id.to_owned(),
                    repo_path,
                    task: entry.config.task.clone(),
                    policy: entry.config.policy.clone(),
                    env: HashMap::new(),
                }
            };

            match adapter.start_session(args).await {
                Ok(pid) => {
                    if self.inner.confirm_started(session_id, pid) {
                        return Ok(());
                    }
                    warn!(pid, "session stopped while the provider was starting");
                    if let Err(err) = adapter.stop().await {
                        warn!(%err, "failed to stop provider of a stopped session");
                    }
                    Err(AppError::InvalidTransition(format!(
                        "session {session_id} stopped while the provider was starting"
                    )))
                }
                Err(err) => {
                    error!(%err, "provider failed to start");
                    let ending = Ending::Failed(format!("provider failed to start: {err}"));
                    if let Err(stop_err) = self.inner.terminate(session_id, ending).await {
                        debug!(%stop_err, "session already gone after start failure");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Forward raw input to the session's provider.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for an unknown session, `AppError::Adapter` when
    /// no adapter is bound or the write fails.
    pub async fn send_input(&self, session_id: &str, data: &str) -> Result<()> {
        let span = info_span!("send_input", session_id, bytes = data.len());
        async {
            let adapter = {
                let mut sessions = self.inner.lock();
                let entry = get_entry(&mut sessions, session_id)?;
                entry.adapter.clone().ok_or_else(|| {
                    AppError::Adapter(format!("No adapter bound for session {session_id}"))
                })?
            };
            adapter.send_input(data).await
        }
        .instrument(span)
        .await
    }

    /// Move a running session to `PAUSED_BY_HUMAN`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` or `AppError::InvalidTransition`.
    pub fn pause_session(&self, session_id: &str) -> Result<()> {
        let _span = info_span!("pause_session", session_id).entered();
        let mut sessions = self.inner.lock();
        let entry = get_entry(&mut sessions, session_id)?;
        self.inner
            .transition(entry, SessionState::PausedByHuman, None)?;
        info!("session paused");
        Ok(())
    }

    /// Resume a paused session.
    ///
    /// A session with pending approvals passes through `RUNNING` straight
    /// back to `WAITING_FOR_APPROVAL`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound`, or `AppError::InvalidTransition` when the
    /// session is not paused.
    pub fn resume_session(&self, session_id: &str) -> Result<()> {
        let _span = info_span!("resume_session", session_id).entered();
        let mut sessions = self.inner.lock();
        let entry = get_entry(&mut sessions, session_id)?;
        let state = entry.runtime.state;
        if state != SessionState::PausedByHuman {
            return Err(AppError::InvalidTransition(format!(
                "session {session_id} is not paused (state {state})"
            )));
        }
        self.inner.transition(entry, SessionState::Running, None)?;
        if !entry.runtime.pending_approvals.is_empty() {
            self.inner
                .transition(entry, SessionState::WaitingForApproval, None)?;
        }
        info!("session resumed");
        Ok(())
    }

    /// Stop a session and wait for cleanup.
    ///
    /// A graceful stop ends `COMPLETED`, an ungraceful one `FAILED`. If the
    /// session is already stopping this waits for that teardown instead.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for an unknown session.
    pub async fn stop_session(&self, session_id: &str, graceful: bool) -> Result<()> {
        let span = info_span!("stop_session", session_id, graceful);
        let ending = if graceful {
            Ending::Completed(Some("stopped by operator".into()))
        } else {
            Ending::Failed("stopped by operator (ungraceful)".into())
        };
        self.inner.terminate(session_id, ending).instrument(span).await
    }

    /// Record an operator decision on a pending approval.
    ///
    /// A denial whose configured action is `stop` fails the session.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown session or approval.
    /// - `AppError::Validation` for `cancelled`, which only teardown issues.
    pub async fn resolve_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<()> {
        let span = info_span!("resolve_approval", session_id, approval_id, decision = decision.as_str());
        async {
            if decision == ApprovalDecision::Cancelled {
                return Err(AppError::Validation(
                    "decision 'cancelled' is reserved for session teardown".into(),
                ));
            }

            let (adapter, stop) = {
                let mut sessions = self.inner.lock();
                let entry = get_entry(&mut sessions, session_id)?;
                let mut request = entry
                    .runtime
                    .pending_approvals
                    .remove(approval_id)
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "approval {approval_id} not found for session {session_id}"
                        ))
                    })?;
                request.resolve(decision);

                let stop = decision == ApprovalDecision::Denied
                    && entry.evaluator.deny_action(request.category, request.risk)
                        == DenyAction::Stop;
                if !stop
                    && entry.runtime.pending_approvals.is_empty()
                    && entry.runtime.state == SessionState::WaitingForApproval
                {
                    self.inner.transition(entry, SessionState::Running, None)?;
                }
                self.inner.emit(
                    entry,
                    RunnerEventPayload::ApprovalResolved {
                        approval_id: approval_id.to_owned(),
                        decision,
                        note,
                    },
                );
                (entry.adapter.clone(), stop)
            };

            if let Some(adapter) = adapter {
                if let Some(reply) = adapter.approval_reply(approval_id, decision) {
                    if let Err(err) = adapter.send_input(&reply).await {
                        warn!(%err, "failed to forward approval reply to provider");
                    }
                }
            }

            if stop {
                info!("denied approval stops the session");
                let ending = Ending::Failed(format!(
                    "approval {approval_id} denied; session stopped by policy"
                ));
                self.inner.terminate(session_id, ending).await?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    // ── Reads ───────────────────────────────────────────────

    /// Snapshot of one session.
    #[must_use]
    pub fn get_session_state(&self, session_id: &str) -> Option<SessionSnapshot> {
        let now = Instant::now();
        self.inner
            .lock()
            .get(session_id)
            .map(|entry| entry.snapshot(now))
    }

    /// Snapshots of all registered sessions, oldest first.
    #[must_use]
    pub fn get_active_sessions(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .lock()
            .values()
            .map(|entry| entry.snapshot(now))
            .collect();
        snapshots.sort_by(|a, b| {
            a.runtime
                .created_at
                .cmp(&b.runtime.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        snapshots
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn get_session_stats(&self) -> SessionStats {
        let sessions = self.inner.lock();
        let mut stats = SessionStats {
            active: sessions.len(),
            max_sessions: self.inner.options.max_sessions,
            by_state: std::collections::BTreeMap::new(),
            pending_approvals: 0,
        };
        for entry in sessions.values() {
            *stats.by_state.entry(entry.runtime.state).or_insert(0) += 1;
            stats.pending_approvals += entry.runtime.pending_approvals.len();
        }
        stats
    }

    // ── Shutdown ────────────────────────────────────────────

    /// Stop every session within the shutdown timeout and stop the ticker.
    /// Idempotent; later `start_session` calls fail with `NotInitialized`.
    pub async fn shutdown(&self) {
        let span = info_span!("session_manager_shutdown");
        async {
            let previous = {
                let mut lifecycle = self
                    .inner
                    .lifecycle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::replace(&mut *lifecycle, Lifecycle::ShutDown)
            };
            match previous {
                Lifecycle::ShutDown => {
                    debug!("session manager already shut down");
                    return;
                }
                Lifecycle::Running(cancel) => cancel.cancel(),
                Lifecycle::Idle => {}
            }

            let ids: Vec<String> = self.inner.lock().keys().cloned().collect();
            info!(sessions = ids.len(), "stopping all sessions");

            let stops = ids.iter().map(|id| {
                self.inner
                    .terminate(id, Ending::Completed(Some("runner shutting down".into())))
            });
            let all = futures_util::future::join_all(stops);
            if tokio::time::timeout(self.inner.options.shutdown_timeout, all)
                .await
                .is_err()
            {
                warn!("shutdown timeout elapsed, discarding remaining sessions");
            }

            let leftovers: Vec<SessionEntry> = {
                let mut sessions = self.inner.lock();
                sessions.drain().map(|(_, entry)| entry).collect()
            };
            for mut entry in leftovers {
                entry.abort_tasks();
                warn!(session_id = %entry.config.session_id, "session discarded during shutdown");
            }
            info!("session manager shut down");
        }
        .instrument(span)
        .await;
    }

    fn ensure_running(&self) -> Result<()> {
        match *self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Lifecycle::Running(_) => Ok(()),
            Lifecycle::Idle => Err(AppError::NotInitialized(
                "session manager not initialized".into(),
            )),
            Lifecycle::ShutDown => Err(AppError::NotInitialized(
                "session manager has been shut down".into(),
            )),
        }
    }
}

fn get_entry<'a>(sessions: &'a mut Registry, session_id: &str) -> Result<&'a mut SessionEntry> {
    sessions
        .get_mut(session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
}

// ── Core transitions ────────────────────────────────────────

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next sequence number and deliver the event.
    fn emit(&self, entry: &mut SessionEntry, payload: RunnerEventPayload) {
        entry.runtime.last_event_seq += 1;
        let event = RunnerEvent {
            payload,
            session_id: entry.config.session_id.clone(),
            org_id: entry.config.org_id.clone(),
            ts: Utc::now(),
            seq: entry.runtime.last_event_seq,
            repo_ref: entry.config.repo_ref(),
        };
        debug!(
            session_id = %event.session_id,
            seq = event.seq,
            kind = event.kind().as_str(),
            "runner event"
        );
        self.subscribers.emit(&event);
    }

    fn transition(
        &self,
        entry: &mut SessionEntry,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<()> {
        let from = entry.runtime.state;
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition(format!(
                "session {} cannot move from {from} to {to}",
                entry.config.session_id
            )));
        }

        let now = Instant::now();
        if from == SessionState::Running {
            entry.usage.stop_clock(now);
        }
        if to == SessionState::Running {
            entry.usage.start_clock(now);
        }
        entry.runtime.state = to;
        entry.runtime.updated_at = Utc::now();

        info!(
            session_id = %entry.config.session_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "session state changed"
        );
        self.emit(
            entry,
            RunnerEventPayload::SessionStateChanged { from, to, reason },
        );
        Ok(())
    }

    /// Mark the session started. Returns `false` when the session is gone
    /// or already stopping, in which case the provider has no owner.
    fn confirm_started(&self, session_id: &str, pid: u32) -> bool {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        self.mark_started(entry, pid);
        !matches!(
            entry.runtime.state,
            SessionState::Stopping | SessionState::Completed | SessionState::Failed
        )
    }

    /// `STARTING_PROVIDER` → `RUNNING` once a pid is known. Later calls
    /// are no-ops.
    fn mark_started(&self, entry: &mut SessionEntry, pid: u32) {
        if entry.runtime.state != SessionState::StartingProvider {
            return;
        }
        entry.runtime.provider_pid = Some(pid);
        if self.transition(entry, SessionState::Running, None).is_err() {
            return;
        }
        self.emit(
            entry,
            RunnerEventPayload::SessionStarted {
                provider_id: entry.config.provider_id.clone(),
                pid,
                provider_version: entry.provider_version.clone(),
            },
        );
        if !entry.runtime.pending_approvals.is_empty() {
            if let Err(err) = self.transition(entry, SessionState::WaitingForApproval, None) {
                warn!(%err, "could not wait on approvals raised during start");
            }
        }
    }

    fn open_approval(
        &self,
        entry: &mut SessionEntry,
        approval_id: Option<String>,
        category: ApprovalCategory,
        risk: RiskLevel,
        summary: String,
    ) {
        let request = ApprovalRequest::new(
            approval_id,
            entry.config.session_id.clone(),
            category,
            risk,
            summary,
        );
        if entry.runtime.pending_approvals.contains_key(&request.id) {
            debug!(approval_id = %request.id, "duplicate approval request ignored");
            return;
        }
        entry.usage.record_approval();
        entry
            .runtime
            .pending_approvals
            .insert(request.id.clone(), request.clone());
        if entry.runtime.state == SessionState::Running {
            if let Err(err) = self.transition(entry, SessionState::WaitingForApproval, None) {
                warn!(%err, approval_id = %request.id, "could not enter approval wait");
            }
        }
        self.emit(
            entry,
            RunnerEventPayload::ApprovalRequested { approval: request },
        );
    }

    /// Translate one provider event into runner events.
    #[allow(clippy::too_many_lines)] // Exhaustive match over provider events.
    fn handle_provider_event(self: &Arc<Self>, session_id: &str, event: &ProviderEvent) {
        let mut ending = None;
        {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(session_id) else {
                debug!(session_id, "provider event for unknown session dropped");
                return;
            };
            let stopping = entry.runtime.state == SessionState::Stopping;

            match event {
                ProviderEvent::Started { pid, version } => {
                    if version.is_some() {
                        entry.provider_version.clone_from(version);
                    }
                    self.mark_started(entry, *pid);
                }
                ProviderEvent::Message { stream, text } => {
                    entry.usage.record_output(text.len());
                    if self.options.forward_terminal_output {
                        self.emit(
                            entry,
                            RunnerEventPayload::TerminalOutput {
                                stream: *stream,
                                data: text.clone(),
                            },
                        );
                    }
                }
                ProviderEvent::FilesTouched { paths, operation } => {
                    for path in paths {
                        entry.usage.record_file(path);
                        self.emit(
                            entry,
                            RunnerEventPayload::FileTouched {
                                path: path.clone(),
                                reason: operation.as_str().to_owned(),
                            },
                        );
                        if operation.is_mutation() && ending.is_none() {
                            let delete = *operation == FileOperation::Delete;
                            if let Verdict::Denied(rule) = entry.evaluator.evaluate_write(path, delete) {
                                ending = Some(Ending::Failed(format!("policy violation: {rule}")));
                            }
                        }
                    }
                }
                ProviderEvent::DiffHint {
                    path,
                    additions,
                    deletions,
                    summary,
                } => self.emit(
                    entry,
                    RunnerEventPayload::DiffSummary {
                        path: path.clone(),
                        additions: *additions,
                        deletions: *deletions,
                        summary: summary.clone(),
                    },
                ),
                ProviderEvent::ToolRequest {
                    tool,
                    command,
                    category,
                } => {
                    let verdict = match command {
                        Some(command) => entry.evaluator.evaluate_command(command),
                        None if entry.evaluator.requires_approval(*category) => {
                            Verdict::RequiresApproval(*category)
                        }
                        None => Verdict::Allowed,
                    };
                    match verdict {
                        Verdict::Allowed => {
                            entry.usage.record_command();
                            self.emit(
                                entry,
                                RunnerEventPayload::CommandExecuted {
                                    tool: tool.clone(),
                                    command: command.clone(),
                                },
                            );
                        }
                        Verdict::Denied(rule) => {
                            ending = Some(Ending::Failed(format!("policy violation: {rule}")));
                        }
                        Verdict::RequiresApproval(category) if !stopping => {
                            let summary = command.clone().unwrap_or_else(|| tool.clone());
                            self.open_approval(entry, None, category, category.default_risk(), summary);
                        }
                        Verdict::RequiresApproval(_) => {}
                    }
                }
                ProviderEvent::RequestApproval {
                    approval_id,
                    category,
                    risk,
                    summary,
                } => {
                    if !stopping {
                        self.open_approval(entry, approval_id.clone(), *category, *risk, summary.clone());
                    }
                }
                ProviderEvent::Error { message, fatal } => {
                    self.emit(
                        entry,
                        RunnerEventPayload::ProviderError {
                            message: message.clone(),
                            fatal: *fatal,
                        },
                    );
                    if *fatal {
                        ending = Some(Ending::Failed(format!("provider error: {message}")));
                    }
                }
                ProviderEvent::Stopped { exit_code, reason } => {
                    // First exit wins; the stop path may report a second one.
                    if entry.runtime.exit_code.is_none() {
                        entry.runtime.exit_code = *exit_code;
                    }
                    if !stopping {
                        info!(session_id, exit_code = ?exit_code, "provider exited on its own");
                        ending = Some(if *exit_code == Some(0) {
                            Ending::Completed(Some(reason.clone()))
                        } else {
                            Ending::Failed(reason.clone())
                        });
                    }
                }
            }

            if stopping {
                ending = None;
            }
        }

        if let Some(ending) = ending {
            self.spawn_terminate(session_id.to_owned(), ending);
        }
    }

    fn spawn_terminate(self: &Arc<Self>, session_id: String, ending: Ending) {
        let inner = Arc::clone(self);
        let span = info_span!("terminate", session_id = %session_id);
        tokio::spawn(
            async move {
                if let Err(err) = inner.terminate(&session_id, ending).await {
                    debug!(%err, "terminate skipped");
                }
            }
            .instrument(span),
        );
    }

    /// Enter `STOPPING`, cancel pending approvals and detach background
    /// work. Returns the adapter and its subscription for teardown.
    fn begin_stopping(
        &self,
        entry: &mut SessionEntry,
        ending: &Ending,
    ) -> Result<(Option<SharedAdapter>, Option<SubscriptionId>)> {
        if let Ending::Failed(message) = ending {
            entry.runtime.last_error = Some(message.clone());
        }
        self.transition(entry, SessionState::Stopping, ending.reason())?;

        let pending = std::mem::take(&mut entry.runtime.pending_approvals);
        for (approval_id, mut request) in pending {
            request.resolve(ApprovalDecision::Cancelled);
            self.emit(
                entry,
                RunnerEventPayload::ApprovalResolved {
                    approval_id,
                    decision: ApprovalDecision::Cancelled,
                    note: Some("session stopping".into()),
                },
            );
        }

        entry.abort_tasks();
        entry.watcher = None;
        entry
            .workspace
            .send_replace(WorkspacePhase::Failed("session stopping".into()));
        Ok((entry.adapter.clone(), entry.subscription.take()))
    }

    /// Drive a session through `STOPPING` to its terminal state and purge
    /// it. Concurrent callers wait for the first teardown to finish.
    async fn terminate(&self, session_id: &str, ending: Ending) -> Result<()> {
        // Phase 1: enter STOPPING and detach everything under the lock.
        let teardown = {
            let mut sessions = self.lock();
            let entry = get_entry(&mut sessions, session_id)?;

            if entry.runtime.state == SessionState::Stopping {
                Teardown::Wait(entry.ended.subscribe())
            } else {
                Teardown::Proceed(self.begin_stopping(entry, &ending)?)
            }
        };
        let (adapter, subscription) = match teardown {
            Teardown::Wait(mut ended) => {
                // Err means the sender was dropped, i.e. the session is gone.
                let _ = ended.changed().await;
                return Ok(());
            }
            Teardown::Proceed(detached) => detached,
        };

        // Phase 2: stop the provider and tear down the workspace.
        let bound = self.options.stop_timeout;
        if let Some(adapter) = &adapter {
            match tokio::time::timeout(bound, adapter.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session_id, %err, "adapter stop failed"),
                Err(_) => warn!(session_id, "adapter stop timed out"),
            }
            if let Some(id) = subscription {
                adapter.off_event(id);
            }
        }
        match tokio::time::timeout(bound, self.workspaces.destroy_workspace(session_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session_id, %err, "workspace teardown failed"),
            Err(_) => warn!(session_id, "workspace teardown timed out"),
        }

        // Phase 3: final usage, terminal state, purge.
        let mut sessions = self.lock();
        let Some(mut entry) = sessions.remove(session_id) else {
            return Ok(());
        };
        let metrics = entry.usage.take_interval(Instant::now());
        self.emit(&mut entry, RunnerEventPayload::UsageTick { metrics });

        let outcome = ending.outcome();
        self.transition(&mut entry, outcome.state(), ending.reason())?;
        let usage = entry.usage.total();
        let exit_code = entry.runtime.exit_code;
        self.emit(
            &mut entry,
            RunnerEventPayload::SessionEnded {
                outcome,
                exit_code,
                reason: ending.reason(),
                usage,
            },
        );
        drop(sessions);

        info!(session_id, outcome = ?outcome, "session ended");
        Ok(())
    }

    /// Close the usage interval of every `RUNNING` session and enforce
    /// billing limits.
    fn tick_usage(self: &Arc<Self>) {
        let mut exceeded = Vec::new();
        {
            let now = Instant::now();
            let mut sessions = self.lock();
            for entry in sessions.values_mut() {
                if entry.runtime.state != SessionState::Running {
                    continue;
                }
                let metrics = entry.usage.take_interval(now);
                self.emit(entry, RunnerEventPayload::UsageTick { metrics });
                if let Some(limit) = entry.usage.exceeded(&entry.config.billing) {
                    exceeded.push((entry.config.session_id.clone(), limit));
                }
            }
        }
        for (session_id, limit) in exceeded {
            warn!(%session_id, %limit, "usage limit exceeded");
            self.spawn_terminate(session_id, Ending::Failed(format!("usage limit exceeded: {limit}")));
        }
    }
}

// ── Background tasks ────────────────────────────────────────

async fn prepare_workspace(weak: Weak<ManagerInner>, session_id: String) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let config = match inner.lock().get(&session_id) {
        Some(entry) => entry.config.clone(),
        None => return,
    };

    let result = inner.workspaces.create_workspace(&config).await;
    let failure = match result {
        Ok(info) if info.status == WorkspaceStatus::Ready => {
            inner.workspace_ready(&session_id, info.worktree_path);
            return;
        }
        Ok(info) => info
            .error
            .unwrap_or_else(|| "workspace preparation failed".into()),
        Err(err) => err.to_string(),
    };

    error!(%failure, "workspace preparation failed");
    {
        let sessions = inner.lock();
        if let Some(entry) = sessions.get(&session_id) {
            entry
                .workspace
                .send_replace(WorkspacePhase::Failed(failure.clone()));
        }
    }
    inner.spawn_terminate(
        session_id,
        Ending::Failed(format!("workspace preparation failed: {failure}")),
    );
}

impl ManagerInner {
    fn workspace_ready(self: &Arc<Self>, session_id: &str, path: PathBuf) {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        if entry.runtime.state != SessionState::PreparingWorkspace {
            return;
        }
        info!(session_id, path = %path.display(), "workspace ready");
        entry.runtime.workspace_path = Some(path.clone());

        if self.options.watch_workspace_files {
            let (tx, rx) = mpsc::unbounded_channel();
            match WorkspaceWatcher::start(&path, tx) {
                Ok(watcher) => {
                    entry.watcher = Some(watcher);
                    entry.tasks.push(tokio::spawn(forward_watch_events(
                        Arc::downgrade(self),
                        session_id.to_owned(),
                        rx,
                    )));
                }
                Err(err) => warn!(session_id, %err, "file watcher unavailable"),
            }
        }

        entry.workspace.send_replace(WorkspacePhase::Ready(path));
    }
}

async fn forward_watch_events(
    weak: Weak<ManagerInner>,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<ProviderEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_provider_event(&session_id, &event);
    }
}

async fn session_timeout(weak: Weak<ManagerInner>, session_id: String, limit: Duration) {
    tokio::time::sleep(limit).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    warn!(%session_id, timeout_secs = limit.as_secs(), "session timed out");
    // Detached: terminate aborts this task.
    inner.spawn_terminate(
        session_id,
        Ending::Failed(format!("session timeout after {}s", limit.as_secs())),
    );
}

async fn run_usage_ticker(weak: Weak<ManagerInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.tick_usage();
            }
        }
    }
    debug!("usage ticker stopped");
}
