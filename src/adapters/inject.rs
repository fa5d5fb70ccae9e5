//! PID injection
//!
//! Grafts a DAP listener into an already-running process by driving a
//! native debugger in batch mode: attach to the PID, acquire the host
//! language's GIL, evaluate a short bootstrap through the C API, release
//! the GIL, detach. Platform-dependent by nature, so it lives behind this
//! module boundary; other languages can add their own injectors without
//! touching the DAP core.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use super::alloc_port;

/// How long the injected server needs to spawn its adapter subprocess
/// before its listening socket exists.
const LISTEN_GRACE: Duration = Duration::from_secs(3);

/// Inject a debugpy listener into the Python process `pid`.
///
/// Returns the loopback port the new DAP server listens on. The caller is
/// expected to connect with its usual retry window after this returns.
pub async fn inject_python(pid: u32, _runtime: Option<&str>) -> Result<u16> {
    let port = alloc_port()?;
    // PyRun_SimpleString returns 0 on success and -1 if the source raised,
    // which is how a missing debugpy in the target environment shows up.
    let bootstrap = format!("import debugpy; debugpy.listen((\"127.0.0.1\", {port}))");

    let output = run_native_debugger(pid, &bootstrap)
        .await
        .context("native debugger failed to run")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    tracing::debug!("injector stdout:\n{stdout}");

    if !output.status.success() {
        bail!(
            "injector exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    match run_result(&stdout) {
        Some(0) => {}
        Some(code) => bail!(
            "injection failed inside pid {pid}: the bootstrap returned {code} \
             (is debugpy installed in the target's environment? \
             try: pip install debugpy)"
        ),
        None => bail!(
            "could not verify the injection result for pid {pid}: no return \
             value in the debugger transcript \
             (is debugpy installed in the target's environment? \
             try: pip install debugpy)"
        ),
    }

    tokio::time::sleep(LISTEN_GRACE).await;
    Ok(port)
}

#[cfg(target_os = "macos")]
async fn run_native_debugger(pid: u32, source: &str) -> Result<std::process::Output> {
    let escaped = source.replace('"', "\\\"");
    Command::new("lldb")
        .args(["-p", &pid.to_string(), "--batch"])
        .args(["-o", "expr void *$gil = (void *)PyGILState_Ensure()"])
        .args([
            "-o",
            &format!("expr int $ret = (int)PyRun_SimpleString(\"{escaped}\")"),
        ])
        .args(["-o", "expr (void)PyGILState_Release($gil)"])
        .args(["-o", "expr $ret"])
        .args(["-o", "detach"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to run lldb (is Xcode command line tooling installed?)")
}

#[cfg(not(target_os = "macos"))]
async fn run_native_debugger(pid: u32, source: &str) -> Result<std::process::Output> {
    let escaped = source.replace('"', "\\\"");
    Command::new("gdb")
        .args(["-p", &pid.to_string(), "--batch", "-nx"])
        .args(["-ex", "set $gil = PyGILState_Ensure()"])
        .args([
            "-ex",
            &format!("set $ret = (int)PyRun_SimpleString(\"{escaped}\")"),
        ])
        .args(["-ex", "call (void)PyGILState_Release($gil)"])
        .args(["-ex", "print $ret"])
        .args(["-ex", "detach"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to run gdb (is it installed?)")
}

/// Find the printed value of `$ret` in the debugger's transcript. lldb
/// prints `(int) $ret = 0`, gdb prints `$N = 0`. lldb also echoes the
/// commands themselves, so only lines whose right-hand side is a bare
/// integer count, and the last one wins. `None` means the transcript never
/// showed a return value, which the caller treats as a failure: an
/// unverified injection must not be reported as a working one.
fn run_result(transcript: &str) -> Option<i64> {
    let mut last: Option<i64> = None;
    for line in transcript.lines() {
        if let Some((lhs, rhs)) = line.trim().rsplit_once('=') {
            if lhs.contains("$ret") || lhs.trim_start().starts_with('$') {
                if let Ok(value) = rhs.trim().parse::<i64>() {
                    last = Some(value);
                }
            }
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_lldb_success() {
        let out = "(lldb) expr $ret\n(int) $ret = 0\n";
        assert_eq!(run_result(out), Some(0));
    }

    #[test]
    fn recognises_gdb_failure() {
        let out = "$1 = -1\n";
        assert_eq!(run_result(out), Some(-1));
    }

    #[test]
    fn missing_print_is_unverified_not_success() {
        assert_eq!(run_result("Detaching from process 1234\n"), None);
    }

    #[test]
    fn ignores_echoed_command_lines() {
        let out = concat!(
            "(lldb) expr int $ret = (int)PyRun_SimpleString(\"import debugpy\")\n",
            "(int) $ret = 0\n",
        );
        assert_eq!(run_result(out), Some(0));
    }
}
