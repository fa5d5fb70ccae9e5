//! debugpy adapter strategy
//!
//! The adapter is `python -m debugpy.adapter` serving DAP on a loopback
//! port. debugpy defers the `launch`/`attach` response until
//! `configurationDone`, which the shared handshake already accounts for.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};

use crate::dap::protocol::{StackFrame, Variable};

use super::LaunchOptions;

/// Resolve the python interpreter to use, preferring an explicit runtime.
fn resolve_runtime(runtime: Option<&str>) -> Result<String> {
    if let Some(runtime) = runtime {
        return Ok(runtime.to_string());
    }
    for candidate in ["python3", "python"] {
        if which::which(candidate).is_ok() {
            return Ok(candidate.to_string());
        }
    }
    bail!("no python interpreter found on PATH (use --runtime to point at one)")
}

pub(super) async fn check_installed(runtime: Option<&str>) -> Result<()> {
    let python = resolve_runtime(runtime)?;
    let status = Command::new(&python)
        .args(["-c", "import debugpy"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run {python}"))?;
    if !status.success() {
        bail!("debugpy is not installed for {python} (pip install debugpy)");
    }
    Ok(())
}

pub(super) async fn spawn(runtime: Option<&str>, port: u16) -> Result<Child> {
    let python = resolve_runtime(runtime)?;
    Command::new(&python)
        .args([
            "-m",
            "debugpy.adapter",
            "--host",
            "127.0.0.1",
            "--port",
            &port.to_string(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn debugpy adapter via {python}"))
}

pub(super) fn launch_args(opts: &LaunchOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "program": opts.script,
        "args": opts.args,
        "console": "internalConsole",
        "stopOnEntry": opts.stop_on_entry,
        "justMyCode": false,
    });
    if let Some(cwd) = opts.effective_cwd() {
        body["cwd"] = serde_json::json!(cwd);
    }
    body
}

pub(super) fn attach_args() -> serde_json::Value {
    serde_json::json!({ "justMyCode": false })
}

pub(super) fn is_internal_frame(frame: &StackFrame) -> bool {
    let path = frame
        .source
        .as_ref()
        .and_then(|s| s.path.as_deref())
        .unwrap_or("");
    path.contains("debugpy")
        || path.contains("pydevd")
        || path.starts_with("<frozen")
        || frame.name.starts_with("<module wrapper")
}

pub(super) fn is_internal_variable(var: &Variable) -> bool {
    // Dunders plus debugpy's synthetic grouping entries.
    (var.name.starts_with("__") && var.name.ends_with("__"))
        || var.name == "special variables"
        || var.name == "function variables"
        || var.name == "class variables"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::Source;
    use std::path::PathBuf;

    fn frame(path: &str, name: &str) -> StackFrame {
        StackFrame {
            id: 1,
            name: name.to_string(),
            source: Some(Source::from_path(path)),
            line: 1,
            column: 1,
            presentation_hint: None,
        }
    }

    fn var(name: &str) -> Variable {
        Variable {
            name: name.to_string(),
            value: String::new(),
            type_: None,
            variables_reference: 0,
        }
    }

    #[test]
    fn filters_debugger_machinery_frames() {
        assert!(is_internal_frame(&frame(
            "/usr/lib/python3/site-packages/debugpy/server/api.py",
            "listen"
        )));
        assert!(is_internal_frame(&frame(
            "/x/pydevd/pydevd_runpy.py",
            "_run_code"
        )));
        assert!(!is_internal_frame(&frame("/home/me/app.py", "main")));
    }

    #[test]
    fn filters_dunder_variables() {
        assert!(is_internal_variable(&var("__name__")));
        assert!(is_internal_variable(&var("special variables")));
        assert!(!is_internal_variable(&var("age")));
        assert!(!is_internal_variable(&var("__init")));
    }

    #[test]
    fn launch_body_carries_program_and_cwd() {
        let opts = LaunchOptions {
            script: PathBuf::from("/srv/app/main.py"),
            args: vec!["--fast".to_string()],
            cwd: None,
            stop_on_entry: false,
            runtime: None,
        };
        let body = launch_args(&opts);
        assert_eq!(body["program"], "/srv/app/main.py");
        assert_eq!(body["cwd"], "/srv/app");
        assert_eq!(body["justMyCode"], false);
    }
}
