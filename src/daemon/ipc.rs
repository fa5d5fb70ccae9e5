//! CLI ↔ daemon wire model
//!
//! One JSON command per connection, discriminated on `action`, answered by a
//! loose reply map. Also home to the `file:line[:condition]` breakpoint
//! grammar shared by `start`, `attach` and `break`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapters::BreakpointSpec;

/// A command sent by the CLI over the daemon socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Start {
        script: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakpoints: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_on_entry: Option<bool>,
    },
    Attach {
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakpoints: Option<Vec<String>>,
    },
    Vars,
    Stack,
    Eval {
        expression: String,
    },
    Step {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<StepKind>,
    },
    Continue,
    Break {
        file: String,
        line: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    Source {
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },
    Status,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    pub fn dap_command(&self) -> &'static str {
        match self {
            Self::Over => "next",
            Self::Into => "stepIn",
            Self::Out => "stepOut",
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "over" => Ok(Self::Over),
            "into" => Ok(Self::Into),
            "out" => Ok(Self::Out),
            other => Err(format!("unknown step kind '{other}' (over|into|out)")),
        }
    }
}

/// Where the debuggee is paused, derived from the top stack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: i64,
    pub function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointReport {
    pub file: String,
    pub line: u32,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableReport {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameReport {
    pub name: String,
    pub file: String,
    pub line: i64,
}

/// Reply written back over the socket; at most a handful of these fields is
/// ever set at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoints: Option<Vec<BreakpointReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<VariableReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FrameReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse one `file:line[:condition]` entry. The condition may itself contain
/// `:`, so everything past the second colon is rejoined.
pub fn parse_breakpoint(spec: &str) -> Option<(String, u32, Option<String>)> {
    let mut parts = spec.splitn(3, ':');
    let file = parts.next()?.trim();
    let line = parts.next()?.trim().parse::<u32>().ok()?;
    if file.is_empty() || line == 0 {
        return None;
    }
    let condition = parts
        .next()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from);
    Some((file.to_string(), line, condition))
}

/// Parse a batch of breakpoint strings, resolving relative files against
/// `base`. Malformed entries are skipped.
pub fn parse_breakpoint_specs(specs: &[String], base: Option<&Path>) -> Vec<BreakpointSpec> {
    specs
        .iter()
        .filter_map(|raw| match parse_breakpoint(raw) {
            Some((file, line, condition)) => Some(BreakpointSpec {
                file: resolve_path(Path::new(&file), base),
                line,
                condition,
            }),
            None => {
                tracing::warn!("skipping malformed breakpoint spec {raw:?}");
                None
            }
        })
        .collect()
}

/// Make a path absolute: canonicalize when possible, otherwise join against
/// `base` (or the current directory).
pub fn resolve_path(path: &Path, base: Option<&Path>) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match base {
            Some(base) => base.join(path),
            None => std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf()),
        }
    };
    dunce::canonicalize(&joined).unwrap_or(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_round_trip() {
        let cmd: Command = serde_json::from_str(r#"{"action":"vars"}"#).unwrap();
        assert!(matches!(cmd, Command::Vars));

        let cmd: Command =
            serde_json::from_str(r#"{"action":"eval","expression":"x + 1"}"#).unwrap();
        match cmd {
            Command::Eval { expression } => assert_eq!(expression, "x + 1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn step_kind_defaults_absent() {
        let cmd: Command = serde_json::from_str(r#"{"action":"step"}"#).unwrap();
        match cmd {
            Command::Step { kind } => assert!(kind.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn reply_serialization_skips_unset_fields() {
        let json = serde_json::to_string(&Reply::error("boom")).unwrap();
        assert_eq!(json, r#"{"error":"boom"}"#);
    }

    #[test]
    fn breakpoint_grammar_plain() {
        assert_eq!(
            parse_breakpoint("app.py:25"),
            Some(("app.py".to_string(), 25, None))
        );
    }

    #[test]
    fn breakpoint_grammar_condition_with_colons() {
        assert_eq!(
            parse_breakpoint("app.py:14:i == x[1:3]"),
            Some(("app.py".to_string(), 14, Some("i == x[1:3]".to_string())))
        );
    }

    #[test]
    fn breakpoint_grammar_rejects_garbage() {
        assert_eq!(parse_breakpoint("app.py"), None);
        assert_eq!(parse_breakpoint("app.py:zero"), None);
        assert_eq!(parse_breakpoint("app.py:0"), None);
        assert_eq!(parse_breakpoint(":12"), None);
    }

    #[test]
    fn malformed_specs_are_skipped_not_fatal() {
        let specs = vec![
            "ok.py:3".to_string(),
            "broken".to_string(),
            "also_ok.py:7:n > 2".to_string(),
        ];
        let parsed = parse_breakpoint_specs(&specs, Some(Path::new("/srv")));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].file, PathBuf::from("/srv/ok.py"));
        assert_eq!(parsed[1].condition.as_deref(), Some("n > 2"));
    }
}
