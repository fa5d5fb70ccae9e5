//! agent-debugger
//!
//! A language-agnostic command-line debugger front-end. A small uniform
//! verb surface (start, attach, vars, stack, eval, step, continue, break,
//! source, status, close) is served by a session daemon that speaks the
//! Debug Adapter Protocol to language-specific backends: debugpy for
//! Python, js-debug for Node, dlv for Go, and CodeLLDB for native code.
//!
//! The pieces, leaves first: [`dap`] is the framed transport and
//! correlation client; [`adapters`] knows how to find, spawn, and shake
//! hands with each backend; [`session`] maps verbs onto DAP traffic; and
//! [`daemon`] owns the socket protocol that makes short-lived CLI calls
//! behave like one long-lived debugging session.

pub mod adapters;
pub mod daemon;
pub mod dap;
pub mod session;
