//! Backend-agnostic process driver interface.
//!
//! A driver owns one child process (local PTY or remote daemon session).
//! Its output, errors and exit arrive on a single ordered channel so byte
//! order is preserved and consumers see one stream per process.

use crate::error::{Result, TerminalError};
use crate::protocol::{Backend, ExitInfo};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What to run and how
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete child environment (already merged)
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Something a driver reports about its process
#[derive(Debug)]
pub enum DriverEvent {
    Data(Vec<u8>),
    Exit(ExitInfo),
    Error(TerminalError),
}

/// Receiving half handed out with every driver
pub type DriverEvents = mpsc::UnboundedReceiver<DriverEvent>;

/// Sending half shared by a driver's threads/tasks.
///
/// Enforces that `Exit` is delivered at most once and that nothing follows it.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DriverEvent>,
    exited: Arc<AtomicBool>,
}

/// Create a connected sink/receiver pair
pub fn event_channel() -> (EventSink, DriverEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx,
            exited: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl EventSink {
    pub fn data(&self, data: Vec<u8>) {
        if !self.has_exited() {
            let _ = self.tx.send(DriverEvent::Data(data));
        }
    }

    pub fn error(&self, err: TerminalError) {
        if !self.has_exited() {
            let _ = self.tx.send(DriverEvent::Error(err));
        }
    }

    /// Deliver the exit. Returns false if an exit was already delivered.
    pub fn exit(&self, info: ExitInfo) -> bool {
        if self.exited.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(DriverEvent::Exit(info));
        true
    }

    /// Suppress any further events without delivering an exit
    pub fn seal(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// A running child process, local or remote.
///
/// `write` after `close` or after the process exited is a no-op.
pub trait ProcessDriver: Send + Sync {
    fn backend(&self) -> Backend;

    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Send `signal` (SIGTERM when `None`) to the process
    fn kill(&self, signal: Option<Signal>) -> Result<()>;

    /// Release the process and its resources. Idempotent.
    fn close(&self);
}
