//! Domain model module declarations.

pub mod approval;
pub mod command;
pub mod event;
pub mod policy;
pub mod runner_info;
pub mod session;
