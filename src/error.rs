//! Error taxonomy for the terminal control core.

use crate::protocol::TerminalState;
use thiserror::Error;

pub type Result<T, E = TerminalError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TerminalError {
    /// The proxy socket could not be reached, or went away mid-request
    #[error("connection error: {0}")]
    Connection(String),

    /// The daemon rejected our hello or never answered it
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The daemon refused or timed out a spawn request
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// A frame on the wire could not be decoded. Logged, never fatal.
    #[error("protocol error: {message}")]
    Protocol { message: String, line: String },

    /// Fatal driver failure (PTY allocation, fork, exec)
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Action content matched a dangerous command pattern
    #[error("blocked dangerous content (matched {pattern})")]
    SafetyViolation { pattern: String },

    #[error("operation not allowed in state {state}: {reason}")]
    InvalidState {
        state: TerminalState,
        reason: &'static str,
    },

    #[error("invalid {kind} pattern {pattern:?}: {source}")]
    InvalidPattern {
        kind: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl TerminalError {
    pub(crate) fn protocol(message: impl Into<String>, line: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            line: line.into(),
        }
    }
}

impl From<nix::errno::Errno> for TerminalError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Runtime(errno.desc().to_string())
    }
}
