//! CodeLLDB adapter strategy
//!
//! Debugs native binaries (Rust, C, C++). The adapter binary is located
//! through the `CODELLDB_PATH` environment variable and told to listen on a
//! loopback port.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};

use crate::dap::protocol::{StackFrame, Variable};

use super::LaunchOptions;

fn adapter_binary() -> Result<PathBuf> {
    let path = std::env::var("CODELLDB_PATH")
        .context("CODELLDB_PATH is not set (point it at the codelldb adapter binary)")?;
    let path = PathBuf::from(path);
    if !path.exists() {
        bail!("codelldb not found at {} (check CODELLDB_PATH)", path.display());
    }
    Ok(path)
}

pub(super) fn check_installed() -> Result<()> {
    adapter_binary()?;
    Ok(())
}

pub(super) fn spawn(port: u16) -> Result<Child> {
    let binary = adapter_binary()?;
    Command::new(&binary)
        .arg("--port")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn codelldb")
}

pub(super) fn launch_args(opts: &LaunchOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "program": opts.script,
        "args": opts.args,
        "stopOnEntry": opts.stop_on_entry,
    });
    if let Some(cwd) = opts.effective_cwd() {
        body["cwd"] = serde_json::json!(cwd);
    }
    body
}

pub(super) fn attach_args() -> serde_json::Value {
    serde_json::json!({})
}

pub(super) fn is_internal_frame(frame: &StackFrame) -> bool {
    let path = frame
        .source
        .as_ref()
        .and_then(|s| s.path.as_deref())
        .unwrap_or("");
    path.starts_with("/usr/lib")
        || path.starts_with("/usr/include")
        || path.contains("/rustc/")
        || path.contains("library/std/")
        || path.contains("library/core/")
        || frame.name.starts_with("std::")
        || frame.name.starts_with("core::")
        || frame.name.starts_with("alloc::")
        || frame.name.starts_with("__")
}

pub(super) fn is_internal_variable(var: &Variable) -> bool {
    var.name.starts_with('$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::Source;

    #[test]
    fn filters_standard_library_frames() {
        let frame = StackFrame {
            id: 1,
            name: "std::panicking::begin_panic".to_string(),
            source: Some(Source::from_path(
                "/rustc/abc123/library/std/src/panicking.rs",
            )),
            line: 1,
            column: 1,
            presentation_hint: None,
        };
        assert!(is_internal_frame(&frame));

        let user = StackFrame {
            id: 2,
            name: "myapp::main".to_string(),
            source: Some(Source::from_path("/home/me/src/main.rs")),
            line: 10,
            column: 1,
            presentation_hint: None,
        };
        assert!(!is_internal_frame(&user));
    }
}
