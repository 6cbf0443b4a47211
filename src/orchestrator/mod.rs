//! Session orchestration.
//!
//! Covers the session registry and lifecycle state machine, provider event
//! translation and per-session usage accounting.

pub mod session_manager;
pub mod usage;

pub use session_manager::{SessionManager, SessionManagerOptions};
