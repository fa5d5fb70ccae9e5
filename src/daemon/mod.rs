//! Session daemon
//!
//! A long-lived process owning the single debug session, driven by
//! stateless CLI invocations over a Unix-domain socket. One JSON command
//! per connection, answered by one JSON reply; connections are served
//! sequentially so verbs never interleave.

pub mod client;
pub mod ipc;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::session::Session;

use ipc::{Command, Reply};

/// Cleanup gets this long before the process force-exits anyway.
const SHUTDOWN_ESCAPE: std::time::Duration = std::time::Duration::from_secs(5);

pub fn session_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot resolve HOME")?;
    Ok(home.join(".agent-debugger"))
}

pub fn socket_path() -> Result<PathBuf> {
    Ok(session_dir()?.join("daemon.sock"))
}

pub fn pid_path() -> Result<PathBuf> {
    Ok(session_dir()?.join("daemon.pid"))
}

pub fn log_path() -> Result<PathBuf> {
    Ok(session_dir()?.join("daemon.log"))
}

/// Remove the on-disk artifacts; called on every exit path.
fn remove_artifacts() {
    if let Ok(path) = socket_path() {
        std::fs::remove_file(path).ok();
    }
    if let Ok(path) = pid_path() {
        std::fs::remove_file(path).ok();
    }
}

/// Run the daemon until `close`, a signal, or a fatal error.
pub async fn run() -> Result<()> {
    let dir = session_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let socket = socket_path()?;
    if socket.exists() {
        // A Unix socket binds fine after an unlink even while another
        // daemon listens, so probe for a live one before reaping the file.
        if UnixStream::connect(&socket).await.is_ok() {
            bail!("another daemon is already listening on {}", socket.display());
        }
        std::fs::remove_file(&socket).ok();
    }
    std::fs::write(pid_path()?, std::process::id().to_string())
        .context("cannot write PID file")?;

    // A panic anywhere must not leave stale artifacts that the CLI would
    // mistake for a live daemon.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        remove_artifacts();
        default_hook(info);
        std::process::exit(1);
    }));

    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("cannot bind {}", socket.display()))?;
    tracing::info!("daemon listening on {}", socket.display());

    let mut session = Session::new();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = serve_connection(stream, &mut session, &shutdown_tx).await {
                            tracing::warn!("connection error: {e:#}");
                        }
                    }
                    Err(e) => tracing::error!("accept failed: {e}"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("close requested, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT, shutting down");
                break;
            }
        }
    }

    // If the session or socket teardown wedges, exit anyway.
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_ESCAPE).await;
        tracing::error!("cleanup stalled, forcing exit");
        std::process::exit(1);
    });

    session.dispatch(Command::Close).await;
    drop(listener);
    remove_artifacts();
    Ok(())
}

/// Read one command line, run the verb, write one reply line, half-close.
async fn serve_connection(
    stream: UnixStream,
    session: &mut Session,
    shutdown_tx: &mpsc::Sender<()>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let (reply, is_close) = match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Err(_) => (Reply::error("Invalid JSON"), false),
        Ok(value) => match serde_json::from_value::<Command>(value) {
            Err(e) => (Reply::error(format!("Invalid command: {e}")), false),
            Ok(command) => {
                let is_close = matches!(command, Command::Close);
                tracing::debug!("dispatching {command:?}");
                (session.dispatch(command).await, is_close)
            }
        },
    };

    let mut payload = serde_json::to_string(&reply)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.flush().await?;
    write_half.shutdown().await.ok();

    if is_close {
        // Reply is flushed; let the accept loop wind the process down.
        shutdown_tx.send(()).await.ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_live_under_one_directory() {
        let dir = session_dir().unwrap();
        assert!(socket_path().unwrap().starts_with(&dir));
        assert!(pid_path().unwrap().starts_with(&dir));
        assert!(log_path().unwrap().starts_with(&dir));
    }

    async fn roundtrip(line: &str) -> (Reply, mpsc::Receiver<()>) {
        let (mut cli_side, daemon_side) = UnixStream::pair().unwrap();
        let mut session = Session::new();
        let (tx, rx) = mpsc::channel(1);

        cli_side.write_all(line.as_bytes()).await.unwrap();
        cli_side.write_all(b"\n").await.unwrap();
        serve_connection(daemon_side, &mut session, &tx)
            .await
            .unwrap();

        let mut reader = BufReader::new(cli_side);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        (serde_json::from_str(reply.trim()).unwrap(), rx)
    }

    #[tokio::test]
    async fn malformed_json_is_reported_verbatim() {
        let (reply, _) = roundtrip("this is not json").await;
        assert_eq!(reply.error.as_deref(), Some("Invalid JSON"));
    }

    #[tokio::test]
    async fn schema_violations_name_the_problem() {
        let (reply, _) = roundtrip(r#"{"action":"explode"}"#).await;
        let error = reply.error.unwrap();
        assert!(error.starts_with("Invalid command:"), "got: {error}");
    }

    #[tokio::test]
    async fn status_round_trips_idle_state() {
        let (reply, mut shutdown) = roundtrip(r#"{"action":"status"}"#).await;
        assert!(reply.error.is_none());
        assert_eq!(reply.state.as_deref(), Some("idle"));
        assert!(shutdown.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_schedules_daemon_shutdown_after_reply() {
        let (reply, mut shutdown) = roundtrip(r#"{"action":"close"}"#).await;
        assert!(reply.error.is_none());
        assert_eq!(reply.state.as_deref(), Some("idle"));
        assert!(shutdown.recv().await.is_some());
    }
}
