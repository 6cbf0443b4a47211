//! NDJSON framing for the control-plane connection.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a 1 MiB maximum line length
//! so an unterminated or oversized inbound message cannot exhaust memory.
//! Each `\n`-terminated UTF-8 line is one JSON frame.
//!
//! Besides [`RunnerEvent`](crate::models::event::RunnerEvent) lines the
//! connection carries a handful of control frames ([`ControlFrame`]).
//! Inbound lines are sorted with [`parse_inbound`].

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::models::command::SessionCommand;
use crate::models::runner_info::RunnerInfo;
use crate::{AppError, Result};

/// Maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line codec for the control-plane stream.
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // The length limit applies to decoding only.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Transport(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

// ── Control frames ──────────────────────────────────────────

/// Connection-level frames exchanged besides runner events and commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlFrame {
    /// First frame on every connection.
    Auth {
        /// Control-plane token.
        token: String,
        /// Runner identifier.
        runner_id: String,
    },
    /// Handshake accepted.
    AuthOk,
    /// Handshake rejected.
    AuthError {
        /// Rejection reason.
        #[serde(default)]
        message: Option<String>,
    },
    /// Keepalive probe.
    Ping {
        /// Send time.
        ts: DateTime<Utc>,
    },
    /// Keepalive answer.
    Pong {
        /// Echoed or reply time.
        #[serde(default)]
        ts: Option<DateTime<Utc>>,
    },
    /// Runner status, sent periodically while connected.
    RunnerHeartbeat {
        /// Runner snapshot.
        runner: RunnerInfo,
    },
}

impl ControlFrame {
    /// Serialise to one JSON line (without the newline).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Classified inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Connection-level frame.
    Control(ControlFrame),
    /// Validated session command.
    Command(SessionCommand),
    /// Anything else; the string says why it was rejected.
    Invalid(String),
}

const CONTROL_TAGS: [&str; 6] = [
    "AUTH",
    "AUTH_OK",
    "AUTH_ERROR",
    "PING",
    "PONG",
    "RUNNER_HEARTBEAT",
];

/// Sort one inbound line into a control frame, a session command or an
/// invalid message. Never fails.
#[must_use]
pub fn parse_inbound(line: &str) -> Inbound {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return Inbound::Invalid(format!("invalid json: {err}")),
    };
    let Some(tag) = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
    else {
        return Inbound::Invalid("missing type tag".into());
    };

    if CONTROL_TAGS.contains(&tag.as_str()) {
        return match serde_json::from_value::<ControlFrame>(value) {
            Ok(frame) => Inbound::Control(frame),
            Err(err) => Inbound::Invalid(format!("invalid {tag} frame: {err}")),
        };
    }

    match serde_json::from_value::<SessionCommand>(value) {
        Ok(command) => match command.validate() {
            Ok(()) => Inbound::Command(command),
            Err(err) => Inbound::Invalid(err.to_string()),
        },
        Err(err) => Inbound::Invalid(format!("invalid command: {err}")),
    }
}
