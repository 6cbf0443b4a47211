//! Composition root.
//!
//! Wires the session manager to the event stream: runner events flow out
//! through [`EventStream::send`], inbound commands flow in through
//! [`Runner::dispatch`]. Also owns the heartbeat loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RunnerConfig;
use crate::models::command::SessionCommand;
use crate::models::event::RunnerEvent;
use crate::models::runner_info::RunnerInfo;
use crate::orchestrator::SessionManager;
use crate::provider::{AdapterFactory, SubscriptionId};
use crate::stream::EventStream;
use crate::Result;

/// How long shutdown waits for buffered events to drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level runner wiring.
pub struct Runner {
    config: RunnerConfig,
    sessions: SessionManager,
    stream: EventStream,
    providers: Arc<dyn AdapterFactory>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Option<(SubscriptionId, SubscriptionId)>>,
    stopped: AtomicBool,
}

impl Runner {
    /// Assemble a runner from its parts.
    #[must_use]
    pub fn new(
        config: RunnerConfig,
        sessions: SessionManager,
        stream: EventStream,
        providers: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            config,
            sessions,
            stream,
            providers,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Session manager handle.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Event stream handle.
    #[must_use]
    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Initialise the session manager, detect providers, wire events and
    /// commands, connect upstream and start heartbeats.
    ///
    /// A control plane that cannot be reached is logged, not returned: the
    /// stream keeps buffering and retrying.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotInitialized` if the session manager was
    /// already shut down.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let span = info_span!("runner_start", runner_id = %self.config.runner_id);
        async {
            self.sessions.init()?;

            let detected = self.providers.detect_all().await;
            info!(
                providers = detected.len(),
                installed = self.providers.installed().len(),
                "provider detection complete"
            );

            let stream = self.stream.clone();
            let event_sub = self.sessions.on_event(Arc::new(move |event: &RunnerEvent| {
                if let Err(err) = stream.send(event) {
                    warn!(%err, seq = event.seq, "failed to queue runner event");
                }
            }));

            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let command_sub = self.stream.on_command(Arc::new(move |command: &SessionCommand| {
                if command_tx.send(command.clone()).is_err() {
                    debug!("command dispatcher stopped, dropping command");
                }
            }));
            *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some((event_sub, command_sub));

            let dispatcher = tokio::spawn(
                Arc::clone(self)
                    .run_dispatcher(command_rx)
                    .instrument(info_span!("command_dispatcher")),
            );
            let heartbeat = tokio::spawn(
                Arc::clone(self)
                    .run_heartbeat()
                    .instrument(info_span!("heartbeat")),
            );
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend([dispatcher, heartbeat]);

            if let Err(err) = self.stream.connect().await {
                error!(%err, "control plane connection failed; events will be buffered");
            }

            info!("runner started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Apply one session command.
    ///
    /// `START` returns once the session is registered; binding the provider
    /// continues in the background. `STOP` waits for teardown.
    ///
    /// # Errors
    ///
    /// Propagates the session manager's error for the command.
    pub async fn dispatch(&self, command: SessionCommand) -> Result<()> {
        let span = info_span!(
            "dispatch",
            command = command.name(),
            session_id = command.session_id()
        );
        async {
            match command {
                SessionCommand::Start { config } => {
                    let adapter = self.providers.create(&config.provider_id)?;
                    let session_id = config.session_id.clone();
                    self.sessions.start_session(config)?;

                    let sessions = self.sessions.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) =
                                sessions.set_provider_adapter(&session_id, adapter).await
                            {
                                warn!(%err, "provider binding failed");
                            }
                        }
                        .instrument(info_span!("bind_provider")),
                    );
                    Ok(())
                }
                SessionCommand::Input { session_id, data } => {
                    self.sessions.send_input(&session_id, &data).await
                }
                SessionCommand::Stop {
                    session_id,
                    graceful,
                } => self.sessions.stop_session(&session_id, graceful).await,
                SessionCommand::Pause { session_id } => self.sessions.pause_session(&session_id),
                SessionCommand::Resume { session_id } => self.sessions.resume_session(&session_id),
                SessionCommand::Approve {
                    session_id,
                    approval_id,
                    decision,
                    note,
                } => {
                    self.sessions
                        .resolve_approval(&session_id, &approval_id, decision, note)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Current runner snapshot for heartbeats and the health endpoint.
    #[must_use]
    pub fn runner_info(&self) -> RunnerInfo {
        let stats = self.sessions.get_session_stats();
        RunnerInfo {
            runner_id: self.config.runner_id.clone(),
            mode: self.config.mode,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            capabilities: self.providers.installed(),
            active_session_count: stats.active,
            max_sessions: stats.max_sessions,
            last_heartbeat_at: Utc::now(),
            provider_versions: self.providers.provider_versions(),
        }
    }

    /// Whether the control-plane link is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.stream.is_healthy()
    }

    /// Stop all sessions, drain what the stream can deliver, disconnect.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = info_span!("runner_shutdown");
        async {
            self.cancel.cancel();
            self.sessions.shutdown().await;

            let deadline = tokio::time::Instant::now() + FLUSH_TIMEOUT;
            while self.stream.buffered() > 0
                && self.stream.health() == crate::stream::StreamHealth::Connected
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.stream.close();

            if let Some((event_sub, command_sub)) = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                self.sessions.off_event(event_sub);
                self.stream.off_command(command_sub);
            }
            let tasks: Vec<JoinHandle<()>> = self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for task in tasks {
                task.abort();
            }
            info!("runner shut down");
        }
        .instrument(span)
        .await;
    }

    /// Commands run on one task per command, chained per session: a slow
    /// teardown or a blocked provider write holds up only its own session.
    async fn run_dispatcher(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut lanes: HashMap<String, JoinHandle<()>> = HashMap::new();
        loop {
            let command = tokio::select! {
                () = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            lanes.retain(|_, lane| !lane.is_finished());
            let session_id = command.session_id().to_owned();
            let previous = lanes.remove(&session_id);
            let runner = Arc::clone(&self);
            let span = info_span!("session_lane", session_id = %session_id);
            let lane = tokio::spawn(
                async move {
                    if let Some(previous) = previous {
                        if let Err(err) = previous.await {
                            warn!(%err, "previous command task ended abnormally");
                        }
                    }
                    if let Err(err) = runner.dispatch(command).await {
                        warn!(%err, "command rejected");
                    }
                }
                .instrument(span),
            );
            lanes.insert(session_id, lane);
        }
        debug!(lanes = lanes.len(), "command dispatcher stopped");
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.heartbeat_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.stream.send_heartbeat(self.runner_info()) {
                        debug!("heartbeat skipped, control plane not connected");
                    }
                }
            }
        }
    }
}
