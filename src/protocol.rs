//! Protocol types for agent-pty.
//!
//! Defines the session-facing vocabulary (states, actions, observations,
//! events) and the JSON message format spoken with a remote terminal daemon.

use crate::error::TerminalError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Wire protocol version sent in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Bracketed paste markers
pub const PASTE_START: &str = "\x1b[200~";
pub const PASTE_END: &str = "\x1b[201~";

/// Semantic state of the driven agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Idle,
    Starting,
    /// Agent shows its input prompt
    Ready,
    /// Input was submitted, nothing came back yet
    WaitingResponse,
    /// Agent is producing output
    Processing,
    /// Agent asks something (y/n, menu selection)
    Question,
    /// Agent reports a usage/rate limit
    LimitReached,
    Error,
    Stopping,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::WaitingResponse => "waiting_response",
            Self::Processing => "processing",
            Self::Question => "question",
            Self::LimitReached => "limit_reached",
            Self::Error => "error",
            Self::Stopping => "stopping",
        }
    }

    /// Whether actions may be executed in this state
    pub fn accepts_actions(&self) -> bool {
        !matches!(self, Self::Idle | Self::Stopping)
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which process driver backs a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Child spawned directly in a local pseudo-terminal
    #[default]
    Local,
    /// Child hosted by a terminal daemon behind a Unix socket
    Proxy,
}

impl std::str::FromStr for Backend {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "pty" => Ok(Self::Local),
            "proxy" | "remote" => Ok(Self::Proxy),
            other => Err(TerminalError::Config(format!(
                "invalid backend '{}', expected 'local' or 'proxy'",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Proxy => f.write_str("proxy"),
        }
    }
}

/// Something to type into the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalAction {
    /// Raw keystrokes, no submit
    Type { content: String },
    /// Carriage return
    Enter,
    /// Content followed by carriage return
    Send { content: String },
    /// Reply to a detected question
    Answer { content: String },
    /// Bracketed paste, then submit. Some CLIs mangle raw multi-line writes.
    PasteSubmit { content: String },
    CtrlC,
    CtrlD,
    Wait { ms: u64 },
}

impl TerminalAction {
    /// Text that must pass the safety guard before transmission
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Type { content }
            | Self::Send { content }
            | Self::Answer { content }
            | Self::PasteSubmit { content } => Some(content),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Type { .. } => "type",
            Self::Enter => "enter",
            Self::Send { .. } => "send",
            Self::Answer { .. } => "answer",
            Self::PasteSubmit { .. } => "paste_submit",
            Self::CtrlC => "ctrl_c",
            Self::CtrlD => "ctrl_d",
            Self::Wait { .. } => "wait",
        }
    }

    /// Bytes to write for this action. `Wait` writes nothing.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Type { content } => content.as_bytes().to_vec(),
            Self::Enter => b"\r".to_vec(),
            Self::Send { content } | Self::Answer { content } => {
                format!("{}\r", content).into_bytes()
            }
            Self::PasteSubmit { content } => {
                format!("{}{}{}\r", PASTE_START, content, PASTE_END).into_bytes()
            }
            Self::CtrlC => vec![0x03],
            Self::CtrlD => vec![0x04],
            Self::Wait { .. } => Vec::new(),
        }
    }

    /// Whether this action submits input and should move to `waiting_response`
    pub fn submits(&self) -> bool {
        matches!(
            self,
            Self::Enter | Self::Send { .. } | Self::Answer { .. } | Self::PasteSubmit { .. }
        )
    }
}

/// Outcome of `execute_action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of `wait_for_idle`. Both flags are false when the event stream
/// closed before either happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdleWait {
    /// The quiet period elapsed with no output
    pub idle: bool,
    pub timed_out: bool,
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct TerminalObservation {
    pub state: TerminalState,
    /// Trailing window of stripped output
    pub recent_output: String,
    pub prompt_visible: bool,
    pub last_question: Option<String>,
    pub limit_reset_time: Option<DateTime<Local>>,
    /// Milliseconds since the session started
    pub elapsed_ms: u64,
    /// Milliseconds since the last successful action, if any
    pub since_last_action_ms: Option<u64>,
    pub buffer_lines: usize,
    pub is_streaming: bool,
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

/// Events published by a session controller
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    /// Stripped output chunk
    Output(String),
    StateChange {
        from: TerminalState,
        to: TerminalState,
    },
    Question(String),
    LimitReached(Option<DateTime<Local>>),
    Exit(ExitInfo),
    Error(Arc<TerminalError>),
}

/// Message exchanged with a remote terminal daemon, one per NDJSON line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    HelloOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
    },
    Spawn {
        id: String,
        cmd: String,
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        cols: u16,
        rows: u16,
    },
    Spawned {
        id: String,
        session: String,
    },
    Write {
        session: String,
        data_b64: String,
    },
    Resize {
        session: String,
        cols: u16,
        rows: u16,
    },
    Signal {
        session: String,
        signal: String,
    },
    Data {
        session: String,
        data_b64: String,
    },
    Exit {
        session: String,
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        signal: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        message: String,
    },
}

impl WireMessage {
    /// Session this message is scoped to, if any
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::Write { session, .. }
            | Self::Resize { session, .. }
            | Self::Signal { session, .. }
            | Self::Data { session, .. }
            | Self::Exit { session, .. }
            | Self::Spawned { session, .. } => Some(session),
            Self::Error { session, .. } => session.as_deref(),
            _ => None,
        }
    }
}
