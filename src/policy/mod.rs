//! Session policy enforcement.
//!
//! Policies arrive with the session START command and are read-only for the
//! session's lifetime.

pub mod evaluator;

pub use evaluator::{classify_command, PolicyEvaluator, Verdict};
