//! Debug session orchestration
//!
//! The process-wide session aggregate and the uniform verb surface mapped
//! onto DAP traffic.

mod core;
mod verbs;

pub use core::{Session, SessionState};
