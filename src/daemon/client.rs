//! CLI-side daemon access
//!
//! Every CLI invocation talks to the daemon through here: check the PID
//! file, reap stale artifacts, spawn a detached daemon when needed, then
//! exchange one command for one reply over the socket.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::ipc::{Command, Reply};
use super::{pid_path, socket_path};

const SPAWN_POLL_ATTEMPTS: u32 = 30;
const SPAWN_POLL_DELAY: Duration = Duration::from_millis(100);

/// Send a command, starting the daemon first if none is running.
pub async fn request(command: &Command) -> Result<Reply> {
    ensure_daemon().await?;
    send(command).await
}

/// One connection, one command, one reply.
async fn send(command: &Command) -> Result<Reply> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("cannot connect to daemon at {}", socket.display()))?;

    let mut payload = serde_json::to_string(command)?;
    payload.push('\n');
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        bail!("daemon closed the connection without replying");
    }
    serde_json::from_str(line.trim()).context("daemon sent an unparseable reply")
}

/// The daemon counts as running when the PID file names a live process.
fn daemon_alive() -> bool {
    let Ok(path) = pid_path() else { return false };
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

fn reap_stale_artifacts() -> Result<()> {
    if let Ok(path) = socket_path() {
        std::fs::remove_file(path).ok();
    }
    if let Ok(path) = pid_path() {
        std::fs::remove_file(path).ok();
    }
    Ok(())
}

/// Spawn a detached daemon if no live one exists, then wait for its socket.
pub async fn ensure_daemon() -> Result<()> {
    let socket = socket_path()?;
    if daemon_alive() && socket.exists() {
        return Ok(());
    }
    tracing::debug!("no live daemon, spawning one");
    reap_stale_artifacts()?;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: terminal signals for the CLI must not reach
        // the daemon.
        command.process_group(0);
    }
    command.spawn().context("failed to spawn daemon")?;

    for _ in 0..SPAWN_POLL_ATTEMPTS {
        if UnixStream::connect(&socket).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(SPAWN_POLL_DELAY).await;
    }
    bail!("daemon did not become ready in time (see daemon.log)")
}
