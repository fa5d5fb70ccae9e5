//! Verb dispatch
//!
//! Each CLI verb maps onto a short DAP exchange against the current
//! session. Verbs run strictly one at a time (the daemon serves connections
//! sequentially), which is what lets the transport stay single-consumer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::adapters::{
    classic_handshake, set_breakpoints, Adapter, AppliedBreakpoint, HandshakeKind,
    HandshakeStatus, Language, LaunchOptions, REQUEST_TIMEOUT,
};
use crate::daemon::ipc::{
    parse_breakpoint_specs, resolve_path, BreakpointReport, Command, FrameReport, Reply, StepKind,
    VariableReport,
};
use crate::dap::protocol::{
    EvaluateResponseBody, ExitedEventBody, ScopesResponseBody, StackTraceResponseBody,
    StoppedEventBody, VariablesResponseBody,
};
use crate::dap::DapClient;

use super::core::{location_of, Session, SessionState};

const STOP_POLL_TICK: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Injected listeners take longer to come up than spawned adapters.
const ATTACH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_VARIABLES: usize = 100;
const STACK_LEVELS: i64 = 50;
const SOURCE_CONTEXT_LINES: usize = 5;

impl Session {
    /// Run one verb to completion and produce its reply. Errors never cross
    /// verb boundaries; they are folded into the reply here.
    pub async fn dispatch(&mut self, command: Command) -> Reply {
        let result = match command {
            Command::Start {
                script,
                language,
                breakpoints,
                runtime,
                args,
                cwd,
                stop_on_entry,
            } => {
                self.start(
                    script,
                    language,
                    breakpoints.unwrap_or_default(),
                    runtime,
                    args.unwrap_or_default(),
                    cwd,
                    stop_on_entry.unwrap_or(false),
                )
                .await
            }
            Command::Attach {
                host,
                port,
                pid,
                language,
                runtime,
                breakpoints,
            } => {
                self.attach(host, port, pid, language, runtime, breakpoints.unwrap_or_default())
                    .await
            }
            Command::Vars => self.vars().await,
            Command::Stack => self.stack().await,
            Command::Eval { expression } => self.eval(expression).await,
            Command::Step { kind } => self.step(kind.unwrap_or(StepKind::Over)).await,
            Command::Continue => self.continue_().await,
            Command::Break {
                file,
                line,
                condition,
            } => self.break_(file, line, condition).await,
            Command::Source { file, line } => self.source(file, line).await,
            Command::Status => self.status().await,
            Command::Close => self.close().await,
        };
        result.unwrap_or_else(|e| Reply::error(format!("{e:#}")))
    }

    async fn start(
        &mut self,
        script: String,
        language: Option<String>,
        breakpoints: Vec<String>,
        runtime: Option<String>,
        args: Vec<String>,
        cwd: Option<String>,
        stop_on_entry: bool,
    ) -> Result<Reply> {
        if self.state != SessionState::Idle {
            bail!(
                "a debug session is already active (state: {}); run close first",
                self.state.as_str()
            );
        }
        self.state = SessionState::Starting;
        match self
            .start_inner(script, language, breakpoints, runtime, args, cwd, stop_on_entry)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.cleanup(true).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_inner(
        &mut self,
        script: String,
        language: Option<String>,
        breakpoints: Vec<String>,
        runtime: Option<String>,
        args: Vec<String>,
        cwd: Option<String>,
        stop_on_entry: bool,
    ) -> Result<Reply> {
        let script = resolve_path(Path::new(&script), None);
        if !script.exists() {
            bail!("script not found: {}", script.display());
        }

        let language = match &language {
            Some(name) => Language::from_name(name)
                .with_context(|| format!("unknown language '{name}'"))?,
            None => Language::from_path(&script).with_context(|| {
                format!("cannot infer a debugger for {} (use --language)", script.display())
            })?,
        };
        let adapter = Adapter::for_language(language);
        adapter.check_installed(runtime.as_deref()).await?;

        let opts = LaunchOptions {
            script: script.clone(),
            args,
            cwd: cwd.map(PathBuf::from),
            stop_on_entry,
            runtime,
        };
        let (child, port) = adapter.spawn(&opts).await?;
        self.adapter_child = Some(child);
        self.adapter = Some(adapter);

        let client = DapClient::connect("127.0.0.1", port, CONNECT_TIMEOUT)
            .await
            .context("could not connect to the debug adapter")?;
        self.client = Some(std::sync::Arc::new(client));

        let specs = parse_breakpoint_specs(&breakpoints, script.parent());
        let outcome = classic_handshake(
            self.client()?.as_ref(),
            &adapter,
            HandshakeKind::Launch,
            adapter.launch_args(&opts),
            &specs,
        )
        .await?;

        self.script = Some(script);
        let breakpoints = report_breakpoints(&outcome.breakpoints);
        match outcome.status {
            HandshakeStatus::Paused => {
                self.state = SessionState::Paused;
                self.thread_id = outcome.thread_id;
                let location = self.refresh_top_frame().await.ok().flatten();
                Ok(Reply {
                    status: Some("paused".to_string()),
                    reason: outcome.stop_reason,
                    location: location.as_ref().map(location_of),
                    breakpoints: Some(breakpoints),
                    ..Default::default()
                })
            }
            HandshakeStatus::Terminated => {
                self.state = SessionState::Terminated;
                Ok(Reply {
                    status: Some("terminated".to_string()),
                    breakpoints: Some(breakpoints),
                    ..Default::default()
                })
            }
            HandshakeStatus::Running => {
                self.state = SessionState::Running;
                Ok(Reply {
                    status: Some("running".to_string()),
                    breakpoints: Some(breakpoints),
                    ..Default::default()
                })
            }
        }
    }

    async fn attach(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        pid: Option<u32>,
        language: Option<String>,
        runtime: Option<String>,
        breakpoints: Vec<String>,
    ) -> Result<Reply> {
        if self.state != SessionState::Idle {
            bail!(
                "a debug session is already active (state: {}); run close first",
                self.state.as_str()
            );
        }
        if port.is_some() == pid.is_some() {
            bail!("attach requires exactly one of --port or --pid");
        }
        self.state = SessionState::Starting;
        match self
            .attach_inner(host, port, pid, language, runtime, breakpoints)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // Never signal a debuggee we failed to attach to.
                self.cleanup(false).await;
                Err(e)
            }
        }
    }

    async fn attach_inner(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        pid: Option<u32>,
        language: Option<String>,
        runtime: Option<String>,
        breakpoints: Vec<String>,
    ) -> Result<Reply> {
        let language = match &language {
            Some(name) => Language::from_name(name)
                .with_context(|| format!("unknown language '{name}'"))?,
            // PID injection and bare listeners are a Python workflow today.
            None => Language::Python,
        };
        let adapter = Adapter::for_language(language);
        adapter.check_installed(runtime.as_deref()).await?;

        let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match pid {
            Some(pid) => {
                if !adapter.supports_inject() {
                    bail!(
                        "attaching by PID is not supported for {}",
                        adapter.name()
                    );
                }
                adapter.inject(pid, runtime.as_deref()).await?
            }
            None => port.context("attach requires exactly one of --port or --pid")?,
        };

        let client = DapClient::connect(&host, port, ATTACH_CONNECT_TIMEOUT)
            .await
            .with_context(|| format!("could not connect to debuggee at {host}:{port}"))?;
        self.client = Some(std::sync::Arc::new(client));
        self.adapter = Some(adapter);

        let specs = parse_breakpoint_specs(&breakpoints, None);
        let outcome = classic_handshake(
            self.client()?.as_ref(),
            &adapter,
            HandshakeKind::Attach,
            adapter.attach_args(&host, port),
            &specs,
        )
        .await?;

        self.attached = true;
        self.state = SessionState::Running;
        Ok(Reply {
            status: Some("running".to_string()),
            message: Some(format!("attached to {host}:{port}")),
            breakpoints: Some(report_breakpoints(&outcome.breakpoints)),
            ..Default::default()
        })
    }

    async fn vars(&mut self) -> Result<Reply> {
        self.require_paused("vars")?;
        let client = self.client()?;
        let adapter = self.adapter()?;

        self.refresh_top_frame().await?;
        let frame_id = self
            .frame_id
            .context("no stack frame to read variables from")?;

        let response = client
            .request(
                "scopes",
                Some(serde_json::json!({ "frameId": frame_id })),
                REQUEST_TIMEOUT,
            )
            .await?;
        let scopes: ScopesResponseBody = response
            .body
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(ScopesResponseBody { scopes: vec![] });

        // Adapters disagree on the scope name: debugpy and dlv say
        // "Locals", codelldb says "Local".
        let scope = scopes
            .scopes
            .iter()
            .find(|s| s.name == "Locals" || s.name == "Local")
            .or_else(|| scopes.scopes.first())
            .context("adapter reported no variable scopes")?;

        let response = client
            .request(
                "variables",
                Some(serde_json::json!({
                    "variablesReference": scope.variables_reference,
                    "count": MAX_VARIABLES,
                })),
                REQUEST_TIMEOUT,
            )
            .await?;
        let body: VariablesResponseBody = response
            .body
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(VariablesResponseBody { variables: vec![] });

        let variables = body
            .variables
            .into_iter()
            .take(MAX_VARIABLES)
            .filter(|v| !adapter.is_internal_variable(v))
            .map(|v| VariableReport {
                name: v.name,
                value: v.value,
                type_: v.type_,
            })
            .collect();
        Ok(Reply {
            variables: Some(variables),
            ..Default::default()
        })
    }

    async fn stack(&mut self) -> Result<Reply> {
        self.require_paused("stack")?;
        let client = self.client()?;
        let adapter = self.adapter()?;
        let thread_id = self.thread_id.context("no focused thread")?;

        let response = client
            .request(
                "stackTrace",
                Some(serde_json::json!({
                    "threadId": thread_id,
                    "startFrame": 0,
                    "levels": STACK_LEVELS,
                })),
                REQUEST_TIMEOUT,
            )
            .await?;
        let body: StackTraceResponseBody = response
            .body
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(StackTraceResponseBody {
                stack_frames: vec![],
                total_frames: None,
            });

        let mut frames: Vec<FrameReport> = body
            .stack_frames
            .iter()
            .filter(|f| !adapter.is_internal_frame(f))
            .map(frame_report)
            .collect();
        if frames.is_empty() {
            // Over-aggressive filtering must never hide a real pause.
            frames = body.stack_frames.first().map(frame_report).into_iter().collect();
        }
        Ok(Reply {
            frames: Some(frames),
            ..Default::default()
        })
    }

    async fn eval(&mut self, expression: String) -> Result<Reply> {
        self.require_paused("eval")?;
        let client = self.client()?;
        if self.frame_id.is_none() {
            self.refresh_top_frame().await?;
        }

        // The expression is forwarded verbatim; the adapter owns its
        // semantics.
        let mut args = serde_json::json!({
            "expression": expression,
            "context": "repl",
        });
        if let Some(frame_id) = self.frame_id {
            args["frameId"] = serde_json::json!(frame_id);
        }
        let response = client.request("evaluate", Some(args), REQUEST_TIMEOUT).await?;
        let body: EvaluateResponseBody = response
            .body
            .context("evaluate response had no body")
            .and_then(|b| serde_json::from_value(b).context("bad evaluate response"))?;

        Ok(Reply {
            result: Some(body.result),
            type_: body.type_,
            ..Default::default()
        })
    }

    async fn step(&mut self, kind: StepKind) -> Result<Reply> {
        self.require_paused("step")?;
        let client = self.client()?;
        let thread_id = self.thread_id.context("no focused thread")?;

        client
            .request(
                kind.dap_command(),
                Some(serde_json::json!({ "threadId": thread_id })),
                REQUEST_TIMEOUT,
            )
            .await?;
        self.state = SessionState::Running;
        self.frame_id = None;
        self.wait_for_stop().await
    }

    async fn continue_(&mut self) -> Result<Reply> {
        match self.state {
            SessionState::Paused => {
                let client = self.client()?;
                let thread_id = self.thread_id.context("no focused thread")?;
                client
                    .request(
                        "continue",
                        Some(serde_json::json!({ "threadId": thread_id })),
                        REQUEST_TIMEOUT,
                    )
                    .await?;
                self.state = SessionState::Running;
                self.frame_id = None;
                self.wait_for_stop().await
            }
            // Typical right after attach: the debuggee is already running
            // and we only wait for it to hit something.
            SessionState::Running => self.wait_for_stop().await,
            other => bail!(
                "continue requires a paused or running session (state: {})",
                other.as_str()
            ),
        }
    }

    async fn break_(&mut self, file: String, line: u32, condition: Option<String>) -> Result<Reply> {
        if self.state == SessionState::Idle {
            bail!("break requires an active session (state: idle)");
        }
        let client = self.client()?;
        let base = self.script.as_ref().and_then(|s| s.parent().map(Path::to_path_buf));
        let file = resolve_path(Path::new(&file), base.as_deref());

        // Replaces any previous breakpoints in this file with just this
        // line; DAP's per-file set semantics make that the whole story.
        let spec = crate::adapters::BreakpointSpec {
            file: file.clone(),
            line,
            condition,
        };
        let applied = set_breakpoints(&client, &file, &[&spec]).await?;
        Ok(Reply {
            breakpoints: Some(report_breakpoints(&applied)),
            ..Default::default()
        })
    }

    async fn source(&mut self, file: Option<String>, line: Option<u32>) -> Result<Reply> {
        let (file, center) = match file {
            Some(file) => {
                let base = self.script.as_ref().and_then(|s| s.parent().map(Path::to_path_buf));
                let path = resolve_path(Path::new(&file), base.as_deref());
                let center = line.unwrap_or(1) as usize;
                (path, center)
            }
            None => {
                if self.state != SessionState::Paused {
                    bail!("source without a file requires a paused session");
                }
                let frame = self
                    .refresh_top_frame()
                    .await?
                    .context("no current location")?;
                let location = location_of(&frame);
                let center = line.map(|l| l as usize).unwrap_or(location.line.max(1) as usize);
                (PathBuf::from(location.file), center)
            }
        };

        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        Ok(Reply {
            source: Some(format_source_window(&content, center, SOURCE_CONTEXT_LINES)),
            ..Default::default()
        })
    }

    async fn status(&mut self) -> Result<Reply> {
        let mut reply = Reply::state(self.state.as_str());
        if self.state == SessionState::Paused {
            if let Ok(Some(frame)) = self.refresh_top_frame().await {
                reply.location = Some(location_of(&frame));
            }
        }
        Ok(reply)
    }

    async fn close(&mut self) -> Result<Reply> {
        let terminate = !self.attached;
        self.cleanup(terminate).await;
        Ok(Reply {
            state: Some("idle".to_string()),
            message: Some("session closed".to_string()),
            ..Default::default()
        })
    }

    /// Poll until the debuggee stops or terminates. Unbounded by design;
    /// the CLI may impose its own wall-clock limit.
    async fn wait_for_stop(&mut self) -> Result<Reply> {
        let client = self.client()?;
        loop {
            if let Some(event) = client.wait_for_event("stopped", STOP_POLL_TICK).await {
                return self.on_stopped(event.body).await;
            }

            let exited = client.drain_events("exited").await;
            let terminated = client.drain_events("terminated").await;
            // Program stdout/stderr is not surfaced in replies today.
            client.drain_events("output").await;

            if !exited.is_empty() || !terminated.is_empty() || client.is_closed() {
                let exit_code = exited.first().and_then(|e| {
                    e.body
                        .clone()
                        .and_then(|b| serde_json::from_value::<ExitedEventBody>(b).ok())
                        .map(|b| b.exit_code)
                });
                self.state = SessionState::Terminated;
                self.thread_id = None;
                self.frame_id = None;
                return Ok(Reply {
                    status: Some("terminated".to_string()),
                    exit_code,
                    ..Default::default()
                });
            }
        }
    }

    async fn on_stopped(&mut self, body: Option<serde_json::Value>) -> Result<Reply> {
        let stopped: Option<StoppedEventBody> =
            body.and_then(|b| serde_json::from_value(b).ok());
        // Some adapters omit the thread id; 1 is what they all mean today.
        let thread_id = stopped.as_ref().and_then(|s| s.thread_id).unwrap_or(1);
        self.thread_id = Some(thread_id);
        self.state = SessionState::Paused;

        let location = self.refresh_top_frame().await.ok().flatten();
        Ok(Reply {
            status: Some("paused".to_string()),
            reason: stopped.map(|s| s.reason),
            location: location.as_ref().map(location_of),
            ..Default::default()
        })
    }

    fn require_paused(&self, verb: &str) -> Result<()> {
        if self.state != SessionState::Paused {
            bail!(
                "{verb} requires a paused session (state: {})",
                self.state.as_str()
            );
        }
        Ok(())
    }
}

fn frame_report(frame: &crate::dap::protocol::StackFrame) -> FrameReport {
    FrameReport {
        name: frame.name.clone(),
        file: frame
            .source
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| "<unknown>".to_string()),
        line: frame.line,
    }
}

fn report_breakpoints(applied: &[AppliedBreakpoint]) -> Vec<BreakpointReport> {
    applied
        .iter()
        .map(|b| BreakpointReport {
            file: b.file.clone(),
            line: b.line,
            verified: b.verified,
        })
        .collect()
}

/// Render a ±`radius` line window around `center`, with line numbers and a
/// marker on the center line.
fn format_source_window(content: &str, center: usize, radius: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let total = lines.len();
    let center = center.clamp(1, total.max(1));
    let start = center.saturating_sub(radius).max(1);
    let end = (center + radius).min(total);
    let width = end.to_string().len();

    let mut out = String::new();
    for number in start..=end {
        let marker = if number == center { "→" } else { " " };
        out.push_str(&format!(
            "{marker} {number:>width$} | {}\n",
            lines[number - 1]
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vars_while_idle_reports_precondition() {
        let mut session = Session::new();
        let reply = session.dispatch(Command::Vars).await;
        let error = reply.error.expect("expected an error");
        assert!(error.contains("paused"), "unexpected error: {error}");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let mut session = Session::new();
        session.state = SessionState::Running;
        let reply = session
            .dispatch(Command::Start {
                script: "app.py".to_string(),
                language: None,
                breakpoints: None,
                runtime: None,
                args: None,
                cwd: None,
                stop_on_entry: None,
            })
            .await;
        let error = reply.error.expect("expected an error");
        assert!(error.contains("already active"), "unexpected error: {error}");
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn attach_requires_exactly_one_target() {
        let mut session = Session::new();
        let reply = session
            .dispatch(Command::Attach {
                host: None,
                port: Some(5678),
                pid: Some(1234),
                language: None,
                runtime: None,
                breakpoints: None,
            })
            .await;
        assert!(reply.error.unwrap().contains("exactly one"));

        let reply = session
            .dispatch(Command::Attach {
                host: None,
                port: None,
                pid: None,
                language: None,
                runtime: None,
                breakpoints: None,
            })
            .await;
        assert!(reply.error.unwrap().contains("exactly one"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn step_and_continue_report_wrong_state() {
        let mut session = Session::new();
        let reply = session.dispatch(Command::Step { kind: None }).await;
        assert!(reply.error.unwrap().contains("paused"));

        let reply = session.dispatch(Command::Continue).await;
        assert!(reply.error.unwrap().contains("idle"));
    }

    #[tokio::test]
    async fn close_on_idle_session_is_benign() {
        let mut session = Session::new();
        let reply = session.dispatch(Command::Close).await;
        assert!(reply.error.is_none());
        assert_eq!(reply.state.as_deref(), Some("idle"));
    }

    #[test]
    fn source_window_marks_center_line() {
        let content = (1..=20).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let window = format_source_window(&content, 10, 5);
        let lines: Vec<&str> = window.lines().collect();
        assert_eq!(lines.len(), 11);
        assert!(lines[0].contains(" 5 | line 5"));
        assert!(lines[5].starts_with('→'));
        assert!(lines[5].contains("10 | line 10"));
        assert!(lines[10].contains("15 | line 15"));
    }

    #[test]
    fn source_window_clips_at_file_start() {
        let content = "a\nb\nc\nd";
        let window = format_source_window(content, 1, 5);
        let lines: Vec<&str> = window.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with('→'));
    }

    #[test]
    fn source_window_clips_at_file_end() {
        let content = "a\nb\nc";
        let window = format_source_window(content, 3, 5);
        let lines: Vec<&str> = window.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with('→'));
    }
}
