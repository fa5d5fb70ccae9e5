//! Delve adapter strategy
//!
//! `dlv dap` serves DAP directly on a listening socket and compiles the
//! target package itself in launch mode.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use crate::dap::protocol::{StackFrame, Variable};

use super::LaunchOptions;

pub(super) fn check_installed() -> Result<()> {
    which::which("dlv").context("dlv is not on PATH (go install github.com/go-delve/delve/cmd/dlv@latest)")?;
    Ok(())
}

pub(super) fn spawn(port: u16) -> Result<Child> {
    Command::new("dlv")
        .arg("dap")
        .arg(format!("--listen=127.0.0.1:{port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn dlv dap")
}

pub(super) fn launch_args(opts: &LaunchOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "mode": "debug",
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
    serde_json::json!({ "mode": "remote" })
}

pub(super) fn is_internal_frame(frame: &StackFrame) -> bool {
    let path = frame
        .source
        .as_ref()
        .and_then(|s| s.path.as_deref())
        .unwrap_or("");
    frame.name.starts_with("runtime.")
        || path.contains("/src/runtime/")
        || path.contains("/libexec/src/")
}

pub(super) fn is_internal_variable(var: &Variable) -> bool {
    // dlv surfaces return values and autotmps with a '~' prefix.
    var.name.starts_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::Source;

    #[test]
    fn filters_runtime_frames() {
        let frame = StackFrame {
            id: 1,
            name: "runtime.goexit".to_string(),
            source: Some(Source::from_path("/usr/local/go/src/runtime/asm_amd64.s")),
            line: 1,
            column: 1,
            presentation_hint: None,
        };
        assert!(is_internal_frame(&frame));
    }

    #[test]
    fn filters_synthetic_variables() {
        let var = Variable {
            name: "~r1".to_string(),
            value: String::new(),
            type_: None,
            variables_reference: 0,
        };
        assert!(is_internal_variable(&var));
    }
}
