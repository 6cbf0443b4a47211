//! Bounded outbound queue with critical-event retention.

use std::collections::VecDeque;

use tracing::{error, warn};

/// One serialised runner event awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFrame {
    /// JSON line, without the trailing newline.
    pub line: String,
    /// Whether the event is retained ahead of others.
    pub critical: bool,
    /// Session the event belongs to.
    pub session_id: String,
    /// Event sequence number.
    pub seq: u64,
}

/// What [`EventBuffer::push`] did to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored without dropping anything.
    Stored,
    /// Stored after evicting the oldest non-critical frame.
    EvictedNonCritical,
    /// The incoming non-critical frame was dropped.
    DroppedIncoming,
    /// Stored after evicting the oldest critical frame.
    EvictedCritical,
}

/// FIFO of frames awaiting delivery.
///
/// When full, the oldest non-critical frame makes room. With only critical
/// frames queued an incoming non-critical frame is dropped, while an
/// incoming critical frame evicts the oldest critical one.
#[derive(Debug)]
pub struct EventBuffer {
    frames: VecDeque<BufferedFrame>,
    capacity: usize,
    dropped: u64,
    dropped_critical: u64,
}

impl EventBuffer {
    /// Empty buffer holding at most `capacity` frames (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
            dropped_critical: 0,
        }
    }

    /// Append a frame, evicting as needed.
    pub fn push(&mut self, frame: BufferedFrame) -> PushOutcome {
        if self.frames.len() < self.capacity {
            self.frames.push_back(frame);
            return PushOutcome::Stored;
        }

        if let Some(idx) = self.frames.iter().position(|f| !f.critical) {
            if let Some(evicted) = self.frames.remove(idx) {
                warn!(
                    session_id = %evicted.session_id,
                    seq = evicted.seq,
                    "event buffer full, evicted non-critical event"
                );
            }
            self.dropped += 1;
            self.frames.push_back(frame);
            return PushOutcome::EvictedNonCritical;
        }

        if !frame.critical {
            self.dropped += 1;
            warn!(
                session_id = %frame.session_id,
                seq = frame.seq,
                "event buffer full of critical events, dropped incoming event"
            );
            return PushOutcome::DroppedIncoming;
        }

        if let Some(evicted) = self.frames.pop_front() {
            error!(
                session_id = %evicted.session_id,
                seq = evicted.seq,
                "event buffer full, evicted critical event"
            );
        }
        self.dropped += 1;
        self.dropped_critical += 1;
        self.frames.push_back(frame);
        PushOutcome::EvictedCritical
    }

    /// Oldest frame.
    pub fn pop_front(&mut self) -> Option<BufferedFrame> {
        self.frames.pop_front()
    }

    /// Put back a frame whose delivery failed. May exceed capacity by one.
    pub fn requeue(&mut self, frame: BufferedFrame) {
        self.frames.push_front(frame);
    }

    /// Frames queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Critical frames dropped so far.
    #[must_use]
    pub fn dropped_critical(&self) -> u64 {
        self.dropped_critical
    }
}
