//! adbg: scriptable multi-language debugger CLI
//!
//! Every invocation is short-lived: it forwards one verb to the session
//! daemon (spawning it first if needed), renders the reply, and exits 0 on
//! success or 1 on an error reply.
//!
//! ```bash
//! adbg start app.py --break app.py:25
//! adbg continue
//! adbg vars
//! adbg eval "data['age']"
//! adbg close
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

use agent_debugger::daemon::ipc::{parse_breakpoint, Command, Reply, StepKind};
use agent_debugger::daemon::{self, client};

#[derive(Parser, Debug)]
#[command(name = "adbg", version)]
#[command(about = "Debug Python, JS/TS, Go and Rust programs from the shell", long_about = None)]
struct Cli {
    /// Show debug output on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Launch a script under the debugger
    Start {
        /// Path to the program to debug
        script: String,
        /// Breakpoint as FILE:LINE[:CONDITION]; repeatable
        #[arg(short = 'b', long = "break", value_name = "FILE:LINE[:COND]")]
        breakpoints: Vec<String>,
        /// Debugger to use instead of inferring from the file extension
        #[arg(long)]
        language: Option<String>,
        /// Language runtime to run the adapter with (e.g. a venv python)
        #[arg(long, alias = "python", value_name = "PATH")]
        runtime: Option<String>,
        /// Working directory for the debuggee
        #[arg(long)]
        cwd: Option<String>,
        /// Pause on the first line before running
        #[arg(long)]
        stop_on_entry: bool,
        /// Arguments forwarded to the debuggee
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Attach to an already-running program
    Attach {
        /// Host of a listening DAP server
        #[arg(long)]
        host: Option<String>,
        /// Port of a listening DAP server
        #[arg(long)]
        port: Option<u16>,
        /// Inject into this process id instead (Python only)
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long, alias = "python", value_name = "PATH")]
        runtime: Option<String>,
        #[arg(short = 'b', long = "break", value_name = "FILE:LINE[:COND]")]
        breakpoints: Vec<String>,
    },
    /// Show local variables of the current frame
    Vars,
    /// Show the call stack of the current thread
    Stack,
    /// Evaluate an expression in the paused frame
    Eval { expression: String },
    /// Step the paused program (over, into, out)
    Step { kind: Option<StepKind> },
    /// Resume until the next breakpoint or exit
    Continue,
    /// Set a breakpoint at FILE:LINE[:CONDITION]
    Break { location: String },
    /// Show source around a line (defaults to the current location)
    Source {
        file: Option<String>,
        line: Option<u32>,
    },
    /// Show session state and current location
    Status,
    /// End the session and stop the daemon
    Close,
    /// Run the session daemon (started automatically)
    #[command(hide = true)]
    Daemon,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if matches!(cli.verb, Verb::Daemon) {
        if let Err(e) = run_daemon().await {
            eprintln!("daemon error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    init_cli_logging(cli.verbose);
    let command = match to_command(cli.verb) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    match client::request(&command).await {
        Ok(reply) => {
            let failed = reply.is_error();
            render(&reply);
            std::process::exit(if failed { 1 } else { 0 });
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn to_command(verb: Verb) -> Result<Command> {
    Ok(match verb {
        Verb::Start {
            script,
            breakpoints,
            language,
            runtime,
            cwd,
            stop_on_entry,
            args,
        } => Command::Start {
            script,
            language,
            breakpoints: (!breakpoints.is_empty()).then_some(breakpoints),
            runtime,
            args: (!args.is_empty()).then_some(args),
            cwd,
            stop_on_entry: stop_on_entry.then_some(true),
        },
        Verb::Attach {
            host,
            port,
            pid,
            language,
            runtime,
            breakpoints,
        } => Command::Attach {
            host,
            port,
            pid,
            language,
            runtime,
            breakpoints: (!breakpoints.is_empty()).then_some(breakpoints),
        },
        Verb::Vars => Command::Vars,
        Verb::Stack => Command::Stack,
        Verb::Eval { expression } => Command::Eval { expression },
        Verb::Step { kind } => Command::Step { kind },
        Verb::Continue => Command::Continue,
        Verb::Break { location } => {
            let (file, line, condition) = parse_breakpoint(&location)
                .ok_or_else(|| anyhow::anyhow!("invalid breakpoint '{location}' (FILE:LINE[:CONDITION])"))?;
            Command::Break {
                file,
                line,
                condition,
            }
        }
        Verb::Source { file, line } => Command::Source { file, line },
        Verb::Status => Command::Status,
        Verb::Close => Command::Close,
        Verb::Daemon => unreachable!("handled in main"),
    })
}

/// Print the reply the way a human (or an agent reading text) wants it.
fn render(reply: &Reply) {
    if let Some(error) = &reply.error {
        eprintln!("error: {error}");
        return;
    }
    if let Some(status) = &reply.status {
        match &reply.reason {
            Some(reason) => println!("{status} ({reason})"),
            None => println!("{status}"),
        }
    }
    if let Some(state) = &reply.state {
        println!("{state}");
    }
    if let Some(location) = &reply.location {
        println!("  at {}:{} in {}", location.file, location.line, location.function);
    }
    if let Some(breakpoints) = &reply.breakpoints {
        for bp in breakpoints {
            let mark = if bp.verified { "✓" } else { "✗" };
            println!("  {mark} {}:{}", bp.file, bp.line);
        }
    }
    if let Some(variables) = &reply.variables {
        if variables.is_empty() {
            println!("no locals");
        }
        for var in variables {
            match &var.type_ {
                Some(type_) => println!("{} = {} ({type_})", var.name, var.value),
                None => println!("{} = {}", var.name, var.value),
            }
        }
    }
    if let Some(frames) = &reply.frames {
        for (index, frame) in frames.iter().enumerate() {
            println!("#{index} {} at {}:{}", frame.name, frame.file, frame.line);
        }
    }
    if let Some(result) = &reply.result {
        match &reply.type_ {
            Some(type_) => println!("{result} ({type_})"),
            None => println!("{result}"),
        }
    }
    if let Some(exit_code) = reply.exit_code {
        println!("exit code: {exit_code}");
    }
    if let Some(source) = &reply.source {
        print!("{source}");
    }
    if let Some(message) = &reply.message {
        println!("{message}");
    }
}

fn init_cli_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ADBG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// The daemon is detached from any terminal, so it logs to a file in the
/// session directory.
async fn run_daemon() -> Result<()> {
    let dir = daemon::session_dir()?;
    std::fs::create_dir_all(&dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(daemon::log_path()?)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ADBG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::sync::Arc::new(file))
        .init();
    daemon::run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Verb {
        Cli::try_parse_from(args).expect("argv should parse").verb
    }

    #[test]
    fn break_argument_goes_through_the_grammar() {
        let verb = parse(&["adbg", "break", "app.py:14:i == 3"]);
        match to_command(verb).unwrap() {
            Command::Break {
                file,
                line,
                condition,
            } => {
                assert_eq!(file, "app.py");
                assert_eq!(line, 14);
                assert_eq!(condition.as_deref(), Some("i == 3"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalid_break_location_is_an_argument_error() {
        let verb = parse(&["adbg", "break", "app.py"]);
        let err = to_command(verb).unwrap_err();
        assert!(err.to_string().contains("invalid breakpoint"));
    }

    #[test]
    fn start_omits_empty_optional_fields() {
        let verb = parse(&["adbg", "start", "app.py"]);
        match to_command(verb).unwrap() {
            Command::Start {
                script,
                breakpoints,
                args,
                stop_on_entry,
                ..
            } => {
                assert_eq!(script, "app.py");
                assert!(breakpoints.is_none());
                assert!(args.is_none());
                assert!(stop_on_entry.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn start_collects_repeated_breaks_and_trailing_args() {
        let verb = parse(&[
            "adbg", "start", "app.py", "-b", "app.py:5", "-b", "util.py:9:n > 2",
            "--stop-on-entry", "--", "--fast", "input.txt",
        ]);
        match to_command(verb).unwrap() {
            Command::Start {
                breakpoints,
                args,
                stop_on_entry,
                ..
            } => {
                assert_eq!(
                    breakpoints.unwrap(),
                    vec!["app.py:5".to_string(), "util.py:9:n > 2".to_string()]
                );
                assert_eq!(
                    args.unwrap(),
                    vec!["--fast".to_string(), "input.txt".to_string()]
                );
                assert_eq!(stop_on_entry, Some(true));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn step_kind_parses_and_defaults_to_none() {
        match parse(&["adbg", "step", "into"]) {
            Verb::Step { kind } => assert_eq!(kind, Some(StepKind::Into)),
            other => panic!("unexpected verb: {other:?}"),
        }
        match parse(&["adbg", "step"]) {
            Verb::Step { kind } => assert!(kind.is_none()),
            other => panic!("unexpected verb: {other:?}"),
        }
    }

    #[test]
    fn runtime_accepts_the_python_alias() {
        let verb = parse(&["adbg", "start", "app.py", "--python", "/venv/bin/python"]);
        match to_command(verb).unwrap() {
            Command::Start { runtime, .. } => {
                assert_eq!(runtime.as_deref(), Some("/venv/bin/python"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
