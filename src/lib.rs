//! agent-pty: terminal control core for driving interactive coding agents.
//!
//! A [`SessionController`] runs one agent CLI through a [`ProcessDriver`]
//! (a local pseudo-terminal or a session on a remote terminal daemon),
//! turns its output into a semantic [`TerminalState`], and executes
//! safety-checked [`TerminalAction`]s against it.

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod parser;
pub mod patterns;
pub mod protocol;
pub mod proxy;
pub mod pty;
pub mod session;

pub use config::{Config, ProxyConfig};
pub use driver::{DriverEvent, DriverEvents, EventSink, ProcessDriver, SpawnRequest};
pub use error::{Result, TerminalError};
pub use patterns::{PatternConfig, PatternTable};
pub use protocol::{
    ActionResult, Backend, ExitInfo, IdleWait, TerminalAction, TerminalEvent,
    TerminalObservation, TerminalState,
};
pub use proxy::{ProxyClient, ProxyProcess};
pub use pty::LocalPty;
pub use session::SessionController;
