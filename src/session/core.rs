//! Session aggregate and lifecycle

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::process::Child;

use crate::adapters::{Adapter, REQUEST_TIMEOUT};
use crate::daemon::ipc::Location;
use crate::dap::protocol::{StackFrame, StackTraceResponseBody};
use crate::dap::DapClient;

/// How long a SIGTERM'd adapter child gets before SIGKILL.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }
}

/// The one debug session this daemon owns.
///
/// The DAP client is present exactly while the state is not idle;
/// `thread_id`/`frame_id` are meaningful only while paused; `attached`
/// controls whether closing terminates the debuggee.
pub struct Session {
    pub(super) state: SessionState,
    pub(super) client: Option<Arc<DapClient>>,
    pub(super) adapter: Option<Adapter>,
    pub(super) adapter_child: Option<Child>,
    pub(super) thread_id: Option<i64>,
    pub(super) frame_id: Option<i64>,
    pub(super) script: Option<PathBuf>,
    pub(super) attached: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            client: None,
            adapter: None,
            adapter_child: None,
            thread_id: None,
            frame_id: None,
            script: None,
            attached: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(super) fn client(&self) -> Result<Arc<DapClient>> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => bail!("no active debug session"),
        }
    }

    pub(super) fn adapter(&self) -> Result<Adapter> {
        match self.adapter {
            Some(adapter) => Ok(adapter),
            None => bail!("no active debug session"),
        }
    }

    /// Re-query the top frame of the current thread and remember its id.
    /// Locations are always derived fresh rather than cached across events.
    pub(super) async fn refresh_top_frame(&mut self) -> Result<Option<StackFrame>> {
        let client = self.client()?;
        let Some(thread_id) = self.thread_id else {
            return Ok(None);
        };
        let response = client
            .request(
                "stackTrace",
                Some(serde_json::json!({
                    "threadId": thread_id,
                    "startFrame": 0,
                    "levels": 1,
                })),
                REQUEST_TIMEOUT,
            )
            .await?;
        let body: StackTraceResponseBody = match response.body {
            Some(body) => serde_json::from_value(body)?,
            None => return Ok(None),
        };
        match body.stack_frames.into_iter().next() {
            Some(frame) => {
                self.frame_id = Some(frame.id);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Tear everything down and return to idle. Errors during teardown are
    /// swallowed; this is best-effort by policy.
    pub(super) async fn cleanup(&mut self, terminate_debuggee: bool) {
        if let Some(client) = self.client.take() {
            client.disconnect(terminate_debuggee).await;
        }
        if let Some(child) = self.adapter_child.take() {
            stop_child(child).await;
        }
        self.adapter = None;
        self.thread_id = None;
        self.frame_id = None;
        self.script = None;
        self.attached = false;
        self.state = SessionState::Idle;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn location_of(frame: &StackFrame) -> Location {
    Location {
        file: frame
            .source
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| "<unknown>".to_string()),
        line: frame.line,
        function: frame.name.clone(),
    }
}

/// SIGTERM the adapter child, escalating to SIGKILL after a grace period.
async fn stop_child(mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let deadline = tokio::time::Instant::now() + CHILD_EXIT_GRACE;
        while tokio::time::Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(_) => break,
            }
        }
    }
    child.kill().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::Source;

    #[test]
    fn fresh_session_is_idle_with_no_client() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.client().is_err());
        assert!(!session.attached);
    }

    #[test]
    fn location_derives_from_frame() {
        let frame = StackFrame {
            id: 9,
            name: "compute".to_string(),
            source: Some(Source::from_path("/srv/app.py")),
            line: 25,
            column: 1,
            presentation_hint: None,
        };
        let loc = location_of(&frame);
        assert_eq!(loc.file, "/srv/app.py");
        assert_eq!(loc.line, 25);
        assert_eq!(loc.function, "compute");
    }
}
