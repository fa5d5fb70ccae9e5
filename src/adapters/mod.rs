//! Adapter strategies
//!
//! One strategy per supported language backend: how to find and spawn the
//! adapter, the request bodies its handshake needs, how to attach, and which
//! frames/variables are implementation noise. The handshake sequence itself
//! is shared; all four adapters perform the same classic DAP dance and
//! differ only in the bodies they feed it.

mod codelldb;
mod go;
pub mod inject;
mod node;
mod python;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Child;

use crate::dap::protocol::{
    Breakpoint, SetBreakpointsArguments, SetBreakpointsResponseBody, Source, SourceBreakpoint,
    StackFrame, Variable,
};
use crate::dap::DapClient;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const INITIALIZED_TIMEOUT: Duration = Duration::from_secs(10);
const DEFERRED_TIMEOUT: Duration = Duration::from_secs(15);
const FIRST_STOP_TIMEOUT: Duration = Duration::from_secs(15);
const FIRST_STOP_TICK: Duration = Duration::from_millis(500);

/// Supported source languages, each mapping onto one debug adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Node,
    Go,
    Native,
}

impl Language {
    /// Resolve a `--language` override.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "python" | "py" => Some(Self::Python),
            "node" | "js" | "javascript" | "ts" | "typescript" => Some(Self::Node),
            "go" | "golang" => Some(Self::Go),
            "rust" | "c" | "cpp" | "c++" | "native" => Some(Self::Native),
            _ => None,
        }
    }

    /// Pick a language from the script's file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "js" | "mjs" | "cjs" | "ts" | "tsx" => Some(Self::Node),
            "go" => Some(Self::Go),
            "rs" | "c" | "cc" | "cpp" => Some(Self::Native),
            _ => None,
        }
    }
}

/// Options for launching a debuggee through its adapter.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
    /// Path to the language runtime (e.g. a virtualenv python).
    pub runtime: Option<String>,
}

impl LaunchOptions {
    /// Working directory for the debuggee: explicit, else the script's parent.
    pub fn effective_cwd(&self) -> Option<PathBuf> {
        self.cwd
            .clone()
            .or_else(|| self.script.parent().map(Path::to_path_buf))
    }
}

/// A parsed breakpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub file: PathBuf,
    pub line: u32,
    pub condition: Option<String>,
}

/// What the adapter reported back for one requested breakpoint.
#[derive(Debug, Clone)]
pub struct AppliedBreakpoint {
    pub file: String,
    pub line: u32,
    pub verified: bool,
}

/// Debug adapter strategy, one variant per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    Python,
    Node,
    Go,
    CodeLldb,
}

impl Adapter {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Python => Self::Python,
            Language::Node => Self::Node,
            Language::Go => Self::Go,
            Language::Native => Self::CodeLldb,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python => "debugpy",
            Self::Node => "js-debug",
            Self::Go => "dlv",
            Self::CodeLldb => "codelldb",
        }
    }

    /// Quick verification that the adapter tooling is present.
    pub async fn check_installed(&self, runtime: Option<&str>) -> Result<()> {
        match self {
            Self::Python => python::check_installed(runtime).await,
            Self::Node => node::check_installed(),
            Self::Go => go::check_installed(),
            Self::CodeLldb => codelldb::check_installed(),
        }
    }

    /// Launch the adapter listening on a fresh loopback port.
    pub async fn spawn(&self, opts: &LaunchOptions) -> Result<(Child, u16)> {
        let port = alloc_port()?;
        let child = match self {
            Self::Python => python::spawn(opts.runtime.as_deref(), port).await?,
            Self::Node => node::spawn(port)?,
            Self::Go => go::spawn(port)?,
            Self::CodeLldb => codelldb::spawn(port)?,
        };
        tracing::info!("spawned {} adapter on port {port}", self.name());
        Ok((child, port))
    }

    pub fn initialize_args(&self) -> serde_json::Value {
        serde_json::json!({
            "clientID": "agent-debugger",
            "clientName": "agent-debugger",
            "adapterID": self.name(),
            "locale": "en-US",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path",
            "supportsVariableType": true,
        })
    }

    pub fn launch_args(&self, opts: &LaunchOptions) -> serde_json::Value {
        match self {
            Self::Python => python::launch_args(opts),
            Self::Node => node::launch_args(opts),
            Self::Go => go::launch_args(opts),
            Self::CodeLldb => codelldb::launch_args(opts),
        }
    }

    pub fn attach_args(&self, host: &str, port: u16) -> serde_json::Value {
        match self {
            Self::Python => python::attach_args(),
            Self::Node => node::attach_args(host, port),
            Self::Go => go::attach_args(),
            Self::CodeLldb => codelldb::attach_args(),
        }
    }

    pub fn supports_inject(&self) -> bool {
        matches!(self, Self::Python)
    }

    /// Graft a DAP listener into a running process; returns the port to
    /// connect to.
    pub async fn inject(&self, pid: u32, runtime: Option<&str>) -> Result<u16> {
        match self {
            Self::Python => inject::inject_python(pid, runtime).await,
            other => bail!(
                "attaching by PID is not supported for {} (use host/port)",
                other.name()
            ),
        }
    }

    /// Display filter: adapter/runtime internals to hide from `stack`.
    pub fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        match self {
            Self::Python => python::is_internal_frame(frame),
            Self::Node => node::is_internal_frame(frame),
            Self::Go => go::is_internal_frame(frame),
            Self::CodeLldb => codelldb::is_internal_frame(frame),
        }
    }

    /// Display filter: machinery variables to hide from `vars`.
    pub fn is_internal_variable(&self, var: &Variable) -> bool {
        match self {
            Self::Python => python::is_internal_variable(var),
            Self::Node => node::is_internal_variable(var),
            Self::Go => go::is_internal_variable(var),
            Self::CodeLldb => codelldb::is_internal_variable(var),
        }
    }
}

/// Bind to port 0 on loopback to let the kernel pick a free port.
pub fn alloc_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("failed to allocate a free port")?;
    Ok(listener.local_addr()?.port())
}

/// Whether the handshake launches the debuggee or attaches to a running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Launch,
    Attach,
}

impl HandshakeKind {
    fn command(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// Terminal state of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Paused,
    Running,
    Terminated,
}

#[derive(Debug)]
pub struct HandshakeOutcome {
    pub status: HandshakeStatus,
    pub thread_id: Option<i64>,
    pub stop_reason: Option<String>,
    pub breakpoints: Vec<AppliedBreakpoint>,
}

/// The classic DAP handshake shared by every adapter.
///
/// `launch`/`attach` must be sent deferred: debugpy in particular holds the
/// response back until `configurationDone`, and awaiting it in place would
/// deadlock before breakpoints are registered. The event queue is never
/// cleared between steps: a `stopped` may legally arrive before the
/// deferred response resolves.
pub async fn classic_handshake(
    client: &DapClient,
    adapter: &Adapter,
    kind: HandshakeKind,
    body: serde_json::Value,
    breakpoints: &[BreakpointSpec],
) -> Result<HandshakeOutcome> {
    client
        .request(
            "initialize",
            Some(adapter.initialize_args()),
            REQUEST_TIMEOUT,
        )
        .await
        .context("initialize failed")?;

    let deferred_seq = client.request_deferred(kind.command(), Some(body)).await?;

    if client
        .wait_for_event("initialized", INITIALIZED_TIMEOUT)
        .await
        .is_none()
    {
        bail!(
            "{} adapter never sent the initialized event",
            adapter.name()
        );
    }

    let mut applied = Vec::new();
    for (file, specs) in group_by_file(breakpoints) {
        applied.extend(set_breakpoints(client, &file, &specs).await?);
    }

    client
        .request(
            "setExceptionBreakpoints",
            Some(serde_json::json!({ "filters": [] })),
            REQUEST_TIMEOUT,
        )
        .await
        .context("setExceptionBreakpoints failed")?;

    client
        .request("configurationDone", None, REQUEST_TIMEOUT)
        .await
        .context("configurationDone failed")?;

    client
        .wait_for_response(deferred_seq, DEFERRED_TIMEOUT)
        .await
        .with_context(|| format!("{} request failed", kind.command()))?;

    if kind == HandshakeKind::Attach {
        // The debuggee was already executing; there is no entry stop to
        // wait for.
        return Ok(HandshakeOutcome {
            status: HandshakeStatus::Running,
            thread_id: None,
            stop_reason: None,
            breakpoints: applied,
        });
    }

    // Either the entry/breakpoint stop or a terminated arrives next; a
    // short program may finish before ever pausing.
    let give_up = tokio::time::Instant::now() + FIRST_STOP_TIMEOUT;
    loop {
        if let Some(event) = client.wait_for_event("stopped", FIRST_STOP_TICK).await {
            let body: Option<crate::dap::protocol::StoppedEventBody> =
                event.body.and_then(|b| serde_json::from_value(b).ok());
            return Ok(HandshakeOutcome {
                status: HandshakeStatus::Paused,
                thread_id: Some(body.as_ref().and_then(|b| b.thread_id).unwrap_or(1)),
                stop_reason: body.map(|b| b.reason),
                breakpoints: applied,
            });
        }
        if !client.drain_events("terminated").await.is_empty() || client.is_closed() {
            // The program ran to completion without hitting a breakpoint.
            return Ok(HandshakeOutcome {
                status: HandshakeStatus::Terminated,
                thread_id: None,
                stop_reason: None,
                breakpoints: applied,
            });
        }
        if tokio::time::Instant::now() >= give_up {
            return Ok(HandshakeOutcome {
                status: HandshakeStatus::Running,
                thread_id: None,
                stop_reason: None,
                breakpoints: applied,
            });
        }
    }
}

/// Send the full breakpoint set for one file (DAP replaces per file, so the
/// request must always carry every line for that file).
pub async fn set_breakpoints(
    client: &DapClient,
    file: &Path,
    specs: &[&BreakpointSpec],
) -> Result<Vec<AppliedBreakpoint>> {
    let path = file.to_string_lossy().to_string();
    let args = SetBreakpointsArguments {
        source: Source::from_path(&path),
        breakpoints: specs
            .iter()
            .map(|s| SourceBreakpoint {
                line: s.line as i64,
                condition: s.condition.clone(),
            })
            .collect(),
    };

    let response = client
        .request(
            "setBreakpoints",
            Some(serde_json::to_value(&args)?),
            REQUEST_TIMEOUT,
        )
        .await
        .with_context(|| format!("setBreakpoints failed for {path}"))?;

    let body: SetBreakpointsResponseBody = response
        .body
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or(SetBreakpointsResponseBody {
            breakpoints: vec![],
        });

    if body.breakpoints.len() != specs.len() {
        // DAP requires one reported breakpoint per requested one; pairing
        // below drops the unmatched tail.
        tracing::warn!(
            "adapter reported {} breakpoints for {} requested in {path}",
            body.breakpoints.len(),
            specs.len()
        );
    }

    Ok(body
        .breakpoints
        .iter()
        .zip(specs)
        .map(|(reported, requested): (&Breakpoint, _)| AppliedBreakpoint {
            file: path.clone(),
            line: reported.line.unwrap_or(requested.line as i64) as u32,
            verified: reported.verified,
        })
        .collect())
}

fn group_by_file<'a>(specs: &'a [BreakpointSpec]) -> Vec<(PathBuf, Vec<&'a BreakpointSpec>)> {
    let mut groups: Vec<(PathBuf, Vec<&BreakpointSpec>)> = Vec::new();
    for spec in specs {
        match groups.iter_mut().find(|(file, _)| *file == spec.file) {
            Some((_, list)) => list.push(spec),
            None => groups.push((spec.file.clone(), vec![spec])),
        }
    }
    groups
}
