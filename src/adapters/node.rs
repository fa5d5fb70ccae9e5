//! js-debug adapter strategy
//!
//! Uses the standalone `dapDebugServer.js` entry point of a js-debug
//! install, located through the `JS_DEBUG_PATH` environment variable.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};

use crate::dap::protocol::{StackFrame, Variable};

use super::LaunchOptions;

fn dap_server_script() -> Result<PathBuf> {
    let root = std::env::var("JS_DEBUG_PATH")
        .context("JS_DEBUG_PATH is not set (point it at a js-debug install)")?;
    let script = PathBuf::from(root).join("src/dapDebugServer.js");
    if !script.exists() {
        bail!(
            "js-debug server not found at {} (check JS_DEBUG_PATH)",
            script.display()
        );
    }
    Ok(script)
}

pub(super) fn check_installed() -> Result<()> {
    which::which("node").context("node is not on PATH")?;
    dap_server_script()?;
    Ok(())
}

pub(super) fn spawn(port: u16) -> Result<Child> {
    let script = dap_server_script()?;
    Command::new("node")
        .arg(&script)
        .arg(port.to_string())
        .arg("127.0.0.1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn js-debug server")
}

pub(super) fn launch_args(opts: &LaunchOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "type": "pwa-node",
        "request": "launch",
        "name": "agent-debugger",
        "program": opts.script,
        "args": opts.args,
        "console": "internalConsole",
        "stopOnEntry": opts.stop_on_entry,
    });
    if let Some(cwd) = opts.effective_cwd() {
        body["cwd"] = serde_json::json!(cwd);
    }
    body
}

pub(super) fn attach_args(host: &str, port: u16) -> serde_json::Value {
    serde_json::json!({
        "type": "pwa-node",
        "request": "attach",
        "name": "agent-debugger",
        "host": host,
        "port": port,
    })
}

pub(super) fn is_internal_frame(frame: &StackFrame) -> bool {
    let path = frame
        .source
        .as_ref()
        .and_then(|s| s.path.as_deref())
        .unwrap_or("");
    path.contains("node_modules") || path.starts_with("node:")
}

pub(super) fn is_internal_variable(var: &Variable) -> bool {
    var.name == "__proto__" || var.name.starts_with("[[")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::Source;

    fn frame(path: &str) -> StackFrame {
        StackFrame {
            id: 1,
            name: "fn".to_string(),
            source: Some(Source::from_path(path)),
            line: 1,
            column: 1,
            presentation_hint: None,
        }
    }

    #[test]
    fn filters_runtime_and_dependency_frames() {
        assert!(is_internal_frame(&frame("node:internal/modules/cjs/loader")));
        assert!(is_internal_frame(&frame(
            "/app/node_modules/express/lib/router.js"
        )));
        assert!(!is_internal_frame(&frame("/app/server.js")));
    }

    #[test]
    fn launch_body_targets_pwa_node() {
        let opts = LaunchOptions {
            script: "/app/index.js".into(),
            args: vec![],
            cwd: Some("/app".into()),
            stop_on_entry: true,
            runtime: None,
        };
        let body = launch_args(&opts);
        assert_eq!(body["type"], "pwa-node");
        assert_eq!(body["stopOnEntry"], true);
        assert_eq!(body["cwd"], "/app");
    }
}
