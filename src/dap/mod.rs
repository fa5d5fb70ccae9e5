//! Debug Adapter Protocol transport
//!
//! Frame codec, wire types, and the asynchronous client used to talk to
//! language-specific debug adapters over TCP.

pub mod codec;
mod client;
mod error;
pub mod protocol;

pub use client::DapClient;
pub use error::DapError;
