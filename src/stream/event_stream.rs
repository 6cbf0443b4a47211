//! Delivery of runner events to the control plane.
//!
//! Every event goes through one FIFO [`EventBuffer`]; a single connection
//! task drains it whenever a connection is up, so per-session order holds
//! across reconnects and a frame whose write fails is put back at the
//! front. While disconnected the buffer simply grows, subject to its
//! retention policy.
//!
//! Connection lifecycle:
//!
//! 1. dial through the [`Transport`] and send `AUTH`; wait for `AUTH_OK`
//! 2. on failure retry with a fixed delay up to `connect_attempts` times,
//!    then mark the stream unhealthy and keep retrying in the background
//! 3. while connected, send `PING` every `ping_interval`; a missing `PONG`
//!    by the next ping drops the connection and starts over at 1

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RunnerConfig;
use crate::models::command::SessionCommand;
use crate::models::event::RunnerEvent;
use crate::models::runner_info::RunnerInfo;
use crate::provider::{Listener, SubscriptionId, Subscribers};
use crate::stream::buffer::{BufferedFrame, EventBuffer, PushOutcome};
use crate::stream::codec::{parse_inbound, ControlFrame, FrameCodec, Inbound};
use crate::stream::transport::{BoxedStream, Transport};
use crate::{AppError, Result};

/// Tunables for [`EventStream`].
#[derive(Debug, Clone)]
pub struct EventStreamOptions {
    /// Runner id sent in the handshake.
    pub runner_id: String,
    /// Control-plane token sent in the handshake.
    pub token: String,
    /// Dial attempts per connection cycle.
    pub connect_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Keepalive period.
    pub ping_interval: Duration,
    /// Maximum buffered events.
    pub buffer_capacity: usize,
    /// Bound on waiting for `AUTH_OK`.
    pub handshake_timeout: Duration,
}

impl EventStreamOptions {
    /// Derive options from the runner configuration.
    #[must_use]
    pub fn from_config(config: &RunnerConfig) -> Self {
        let cp = &config.control_plane;
        Self {
            runner_id: config.runner_id.clone(),
            token: cp.token.clone(),
            connect_attempts: cp.connect_attempts.max(1),
            retry_delay: Duration::from_millis(cp.retry_delay_millis),
            ping_interval: Duration::from_secs(cp.ping_interval_seconds.max(1)),
            buffer_capacity: cp.buffer_capacity,
            handshake_timeout: Duration::from_secs(cp.connect_timeout_seconds.max(1)),
        }
    }
}

/// Connection health as seen by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamHealth {
    /// No connection yet, or between reconnect attempts.
    Disconnected,
    /// Authenticated and delivering.
    Connected,
    /// Connect attempts exhausted; still retrying in the background.
    Unhealthy,
    /// [`EventStream::close`] was called.
    Closed,
}

struct StreamState {
    buffer: EventBuffer,
    health: StreamHealth,
    control: Option<mpsc::UnboundedSender<String>>,
    driving: bool,
}

struct StreamInner {
    options: EventStreamOptions,
    transport: Arc<dyn Transport>,
    state: Mutex<StreamState>,
    wake: Notify,
    commands: Subscribers<SessionCommand>,
    cancel: CancellationToken,
}

/// Outbound event delivery plus inbound command intake.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("peer", &self.inner.transport.describe())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

struct Connection {
    reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    writer: FrameWriter,
}

struct FrameWriter {
    io: WriteHalf<BoxedStream>,
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameWriter {
    async fn write_line(&mut self, line: String) -> Result<()> {
        self.buf.clear();
        self.codec.encode(line, &mut self.buf)?;
        self.io
            .write_all(&self.buf)
            .await
            .map_err(|err| AppError::Transport(format!("write failed: {err}")))?;
        self.io
            .flush()
            .await
            .map_err(|err| AppError::Transport(format!("flush failed: {err}")))
    }
}

#[derive(Debug)]
enum Disconnect {
    Cancelled,
    PeerClosed,
    MissedPong,
    Failed(AppError),
}

impl EventStream {
    /// Create a stream dialing through `transport`. Nothing connects until
    /// [`EventStream::connect`].
    #[must_use]
    pub fn new(options: EventStreamOptions, transport: Arc<dyn Transport>) -> Self {
        let buffer = EventBuffer::new(options.buffer_capacity);
        Self {
            inner: Arc::new(StreamInner {
                options,
                transport,
                state: Mutex::new(StreamState {
                    buffer,
                    health: StreamHealth::Disconnected,
                    control: None,
                    driving: false,
                }),
                wake: Notify::new(),
                commands: Subscribers::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Establish the connection and start the delivery task.
    ///
    /// The delivery task keeps reconnecting for the life of the stream even
    /// when this call fails. Calling again while the task runs is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once every attempt of the first cycle
    /// failed; the stream is then marked unhealthy.
    pub async fn connect(&self) -> Result<()> {
        let span = info_span!("event_stream_connect", peer = %self.inner.transport.describe());
        async {
            {
                let mut state = self.inner.lock();
                if state.driving {
                    return Ok(());
                }
                state.driving = true;
            }

            let first = self.inner.connect_with_retries().await;
            let (initial, result) = match first {
                Ok(conn) => (Some(conn), Ok(())),
                Err(err) => {
                    error!(%err, "control plane unreachable, marking runner unhealthy");
                    self.inner.set_health(StreamHealth::Unhealthy);
                    (None, Err(err))
                }
            };

            let inner = Arc::clone(&self.inner);
            tokio::spawn(
                async move { inner.supervise(initial).await }
                    .instrument(info_span!("event_stream")),
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Queue an event for delivery; sent at once when connected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the event cannot be serialised.
    pub fn send(&self, event: &RunnerEvent) -> Result<PushOutcome> {
        let frame = BufferedFrame {
            line: serde_json::to_string(event)?,
            critical: event.is_critical(),
            session_id: event.session_id.clone(),
            seq: event.seq,
        };
        let outcome = self.inner.lock().buffer.push(frame);
        self.inner.wake.notify_one();
        Ok(outcome)
    }

    /// Send a heartbeat if connected. Heartbeats are never buffered.
    pub fn send_heartbeat(&self, runner: RunnerInfo) -> bool {
        let line = match (ControlFrame::RunnerHeartbeat { runner }).to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to serialise heartbeat");
                return false;
            }
        };
        self.inner
            .lock()
            .control
            .as_ref()
            .is_some_and(|tx| tx.send(line).is_ok())
    }

    /// Register a listener for validated inbound commands.
    pub fn on_command(&self, listener: Listener<SessionCommand>) -> SubscriptionId {
        self.inner.commands.subscribe(listener)
    }

    /// Remove a command listener.
    pub fn off_command(&self, id: SubscriptionId) -> bool {
        self.inner.commands.unsubscribe(id)
    }

    /// Current connection health.
    #[must_use]
    pub fn health(&self) -> StreamHealth {
        self.inner.lock().health
    }

    /// Whether connect attempts have not been exhausted.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health() != StreamHealth::Unhealthy
    }

    /// Events awaiting delivery.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Events dropped by the buffer policy, and how many were critical.
    #[must_use]
    pub fn dropped(&self) -> (u64, u64) {
        let state = self.inner.lock();
        (state.buffer.dropped(), state.buffer.dropped_critical())
    }

    /// Stop delivering and disconnect. Buffered events are discarded.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.lock();
        state.health = StreamHealth::Closed;
        state.control = None;
        if !state.buffer.is_empty() {
            warn!(pending = state.buffer.len(), "event stream closed with undelivered events");
        }
    }
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_health(&self, health: StreamHealth) {
        let mut state = self.lock();
        if state.health != StreamHealth::Closed {
            state.health = health;
        }
    }

    // ── Connecting ──────────────────────────────────────────

    async fn connect_with_retries(&self) -> Result<Connection> {
        let attempts = self.options.connect_attempts.max(1);
        let mut last = AppError::Transport("no connect attempt made".into());
        for attempt in 1..=attempts {
            let opened = tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(AppError::Transport("event stream closed".into()));
                }
                opened = self.open() => opened,
            };
            match opened {
                Ok(conn) => {
                    info!(attempt, "connected to control plane");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(attempt, max_attempts = attempts, %err, "control plane connect failed");
                    last = err;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        return Err(AppError::Transport("event stream closed".into()));
                    }
                    () = tokio::time::sleep(self.options.retry_delay) => {}
                }
            }
        }
        Err(AppError::Transport(format!(
            "control plane unreachable after {attempts} attempts: {last}"
        )))
    }

    async fn open(&self) -> Result<Connection> {
        let stream = self.transport.connect().await?;
        let (read, write) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: FramedRead::new(read, FrameCodec::new()),
            writer: FrameWriter {
                io: write,
                codec: FrameCodec::new(),
                buf: BytesMut::new(),
            },
        };

        let auth = ControlFrame::Auth {
            token: self.options.token.clone(),
            runner_id: self.options.runner_id.clone(),
        };
        conn.writer.write_line(auth.to_line()?).await?;

        let reply = tokio::time::timeout(self.options.handshake_timeout, conn.reader.next())
            .await
            .map_err(|_| AppError::Transport("auth handshake timed out".into()))?;
        match reply {
            Some(Ok(line)) => match parse_inbound(&line) {
                Inbound::Control(ControlFrame::AuthOk) => Ok(conn),
                Inbound::Control(ControlFrame::AuthError { message }) => Err(AppError::Transport(
                    format!(
                        "authentication rejected: {}",
                        message.as_deref().unwrap_or("no reason given")
                    ),
                )),
                _ => Err(AppError::Transport("unexpected handshake reply".into())),
            },
            Some(Err(err)) => Err(err),
            None => Err(AppError::Transport("connection closed during handshake".into())),
        }
    }

    // ── Delivery ────────────────────────────────────────────

    async fn supervise(self: Arc<Self>, initial: Option<Connection>) {
        let mut conn = initial;
        loop {
            if let Some(active) = conn.take() {
                self.set_health(StreamHealth::Connected);
                match self.drive(active).await {
                    Disconnect::Cancelled => break,
                    Disconnect::PeerClosed => warn!("control plane closed the connection"),
                    Disconnect::MissedPong => warn!("control plane missed a pong, reconnecting"),
                    Disconnect::Failed(err) => warn!(%err, "control plane connection failed"),
                }
                self.set_health(StreamHealth::Disconnected);
            }
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_with_retries().await {
                Ok(active) => conn = Some(active),
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    error!(%err, "control plane unreachable, marking runner unhealthy");
                    self.set_health(StreamHealth::Unhealthy);
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }

        let mut state = self.lock();
        state.driving = false;
        state.control = None;
        debug!("event stream delivery stopped");
    }

    async fn drive(&self, conn: Connection) -> Disconnect {
        let Connection {
            mut reader,
            mut writer,
        } = conn;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        self.lock().control = Some(control_tx.clone());

        let period = self.options.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        let reason = 'conn: loop {
            while let Some(frame) = self.pop_frame() {
                let seq = frame.seq;
                if let Err(err) = writer.write_line(frame.line.clone()).await {
                    self.lock().buffer.requeue(frame);
                    break 'conn Disconnect::Failed(err);
                }
                debug!(session_id = %frame.session_id, seq, "event delivered");
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Disconnect::Cancelled,
                Some(line) = control_rx.recv() => {
                    if let Err(err) = writer.write_line(line).await {
                        break Disconnect::Failed(err);
                    }
                }
                () = self.wake.notified() => {}
                _ = ping.tick() => {
                    if awaiting_pong {
                        break Disconnect::MissedPong;
                    }
                    awaiting_pong = true;
                    let frame = ControlFrame::Ping { ts: Utc::now() };
                    match frame.to_line() {
                        Ok(line) => {
                            if let Err(err) = writer.write_line(line).await {
                                break Disconnect::Failed(err);
                            }
                        }
                        Err(err) => warn!(%err, "failed to serialise ping"),
                    }
                }
                inbound = reader.next() => match inbound {
                    None => break Disconnect::PeerClosed,
                    Some(Err(err)) => break Disconnect::Failed(err),
                    Some(Ok(line)) => self.handle_inbound(&line, &control_tx, &mut awaiting_pong),
                },
            }
        };

        self.lock().control = None;
        reason
    }

    fn pop_frame(&self) -> Option<BufferedFrame> {
        self.lock().buffer.pop_front()
    }

    fn handle_inbound(
        &self,
        line: &str,
        control: &mpsc::UnboundedSender<String>,
        awaiting_pong: &mut bool,
    ) {
        match parse_inbound(line) {
            Inbound::Control(ControlFrame::Ping { .. }) => {
                let pong = ControlFrame::Pong {
                    ts: Some(Utc::now()),
                };
                if let Ok(line) = pong.to_line() {
                    let _ = control.send(line);
                }
            }
            Inbound::Control(ControlFrame::Pong { .. }) => *awaiting_pong = false,
            Inbound::Control(other) => debug!(?other, "ignoring control frame"),
            Inbound::Command(command) => {
                info!(
                    command = command.name(),
                    session_id = command.session_id(),
                    "command received"
                );
                self.commands.emit(&command);
            }
            Inbound::Invalid(reason) => {
                warn!(%reason, "dropping malformed inbound message");
            }
        }
    }
}
