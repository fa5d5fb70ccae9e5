//! Transport error kinds
//!
//! Callers need to tell a timeout from a closed connection from an adapter
//! rejection, so the transport reports typed errors rather than opaque ones.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("request '{command}' timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("connection to debug adapter closed")]
    ConnectionClosed,

    #[error("no deferred request with seq {0}")]
    UnknownSeq(u64),

    #[error("request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("DAP protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
