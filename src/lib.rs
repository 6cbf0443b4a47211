#![forbid(unsafe_code)]

//! Session orchestration engine for AI coding assistant CLIs.
//!
//! Manages concurrent provider sessions through a per-session lifecycle,
//! normalises provider output into [`models::event::RunnerEvent`]s and
//! streams them to a remote control plane.

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod errors;
pub mod health;
pub mod instrumentation;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod pty;
pub mod runner;
pub mod stream;
pub mod workspace;

pub use config::RunnerConfig;
pub use errors::{AppError, Result};

/// Boxed, sendable future used at trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
