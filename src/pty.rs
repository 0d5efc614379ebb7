//! Local PTY driver: spawns the agent directly in a pseudo-terminal.
//!
//! Provides:
//! - Creating a PTY and spawning a child with merged env, cwd and geometry
//! - A reader thread that turns master output into `Data` events and reaps
//!   the child into exactly one `Exit`
//! - A writer thread that drains an ordered input channel
//! - Best-effort repair of the native helper's execute bits

use crate::driver::{event_channel, DriverEvents, EventSink, ProcessDriver, SpawnRequest};
use crate::error::{Result, TerminalError};
use crate::protocol::{Backend, ExitInfo};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, dup2, execvpe, fork, read, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

static HELPER_CHECK: Once = Once::new();

/// How long a closed child gets to honor SIGHUP before its group is killed
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Make sure `path` carries the execute bits. Returns whether it changed anything.
pub fn ensure_executable(path: &Path) -> std::io::Result<bool> {
    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0o111 {
        return Ok(false);
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o111))?;
    Ok(true)
}

fn repair_helper_once(helper: &Path) {
    HELPER_CHECK.call_once(|| match ensure_executable(helper) {
        Ok(true) => info!("Restored execute permission on PTY helper {:?}", helper),
        Ok(false) => debug!("PTY helper {:?} already executable", helper),
        Err(e) => warn!("Could not fix permissions on PTY helper {:?}: {}", helper, e),
    });
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| TerminalError::Runtime(format!("{} contains a NUL byte: {:?}", what, value)))
}

fn exit_info(status: WaitStatus) -> ExitInfo {
    match status {
        WaitStatus::Exited(_, code) => ExitInfo::code(code),
        WaitStatus::Signaled(_, sig, _) => ExitInfo::signaled(sig.as_str()),
        _ => ExitInfo {
            code: None,
            signal: None,
        },
    }
}

/// Child process running in a local pseudo-terminal
pub struct LocalPty {
    /// Master side, shared with the reader and writer threads
    master_fd: Arc<OwnedFd>,
    child_pid: Pid,
    /// Cleared once the child has been reaped
    running: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    sink: EventSink,
}

impl LocalPty {
    /// Open a PTY and spawn `request` inside it
    pub fn spawn(request: &SpawnRequest, helper: Option<&Path>) -> Result<(Self, DriverEvents)> {
        if request.command.is_empty() {
            return Err(TerminalError::Runtime("command cannot be empty".to_string()));
        }
        if let Some(helper) = helper {
            repair_helper_once(helper);
        }

        // Everything the child needs is allocated before fork
        let cmd = cstring(&request.command, "command")?;
        let mut argv = vec![cmd.clone()];
        for arg in &request.args {
            argv.push(cstring(arg, "argument")?);
        }
        let envp = request
            .env
            .iter()
            .map(|(k, v)| cstring(&format!("{}={}", k, v), "environment"))
            .collect::<Result<Vec<_>>>()?;
        let cwd = match &request.cwd {
            Some(dir) => Some(cstring(&dir.to_string_lossy(), "working directory")?),
            None => None,
        };

        let size = winsize(request.cols, request.rows);
        let OpenptyResult { master, slave } = openpty(&size, None)
            .map_err(|e| TerminalError::Runtime(format!("failed to open PTY: {}", e)))?;

        match unsafe { fork() }
            .map_err(|e| TerminalError::Runtime(format!("failed to fork: {}", e)))?
        {
            ForkResult::Parent { child } => {
                drop(slave);

                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )?;

                info!(
                    "Spawned {} in local PTY with PID {} ({}x{})",
                    request.command, child, request.cols, request.rows
                );

                Ok(Self::start_io(master, child))
            }
            ForkResult::Child => {
                drop(master);

                setsid().ok();
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();
                if slave_raw > 2 {
                    drop(slave);
                }

                if let Some(dir) = &cwd {
                    if chdir(dir.as_c_str()).is_err() {
                        let _ = write(std::io::stderr(), b"agent-pty: cannot enter cwd\r\n");
                        unsafe { libc::_exit(126) };
                    }
                }

                let _ = execvpe(&cmd, &argv, &envp);
                let _ = write(std::io::stderr(), b"agent-pty: exec failed\r\n");
                unsafe { libc::_exit(127) }
            }
        }
    }

    fn start_io(master: OwnedFd, child_pid: Pid) -> (Self, DriverEvents) {
        let master_fd = Arc::new(master);
        let running = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));
        let (sink, events) = event_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        {
            let fd = Arc::clone(&master_fd);
            let running = Arc::clone(&running);
            let sink = sink.clone();
            std::thread::spawn(move || reader_thread(fd, child_pid, running, sink));
        }
        {
            let fd = Arc::clone(&master_fd);
            let closed = Arc::clone(&closed);
            let sink = sink.clone();
            std::thread::spawn(move || writer_thread(fd, closed, input_rx, sink));
        }

        (
            Self {
                master_fd,
                child_pid,
                running,
                closed,
                input_tx,
                sink,
            },
            events,
        )
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ProcessDriver for LocalPty {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() || !self.is_running() || self.sink.has_exited() {
            debug!("Dropping {} byte write to finished PTY", data.len());
            return Ok(());
        }
        let _ = self.input_tx.send(data.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let ws = winsize(cols, rows);
        unsafe {
            if libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) < 0 {
                return Err(TerminalError::Runtime(format!(
                    "failed to resize PTY: {}",
                    Errno::last()
                )));
            }
        }
        debug!("PTY resized to {}x{}", cols, rows);
        Ok(())
    }

    fn kill(&self, sig: Option<Signal>) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let sig = sig.unwrap_or(Signal::SIGTERM);
        debug!("Sending {} to PID {}", sig, self.child_pid);
        match signal::kill(self.child_pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Hang up like a closed terminal would; the reader reaps the child
        if self.is_running() {
            let _ = signal::kill(self.child_pid, Signal::SIGHUP);
            let child = self.child_pid;
            let running = Arc::clone(&self.running);
            std::thread::spawn(move || {
                std::thread::sleep(CLOSE_GRACE);
                if running.load(Ordering::SeqCst) {
                    warn!("Child {} ignored SIGHUP, killing its process group", child);
                    let _ = signal::killpg(child, Signal::SIGKILL);
                }
            });
        }
        // Wake the writer so it notices the closed flag
        let _ = self.input_tx.send(Vec::new());
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        self.close();
        if self.is_running() {
            let _ = signal::kill(self.child_pid, Signal::SIGTERM);
        }
    }
}

fn reader_thread(fd: Arc<OwnedFd>, child: Pid, running: Arc<AtomicBool>, sink: EventSink) {
    let mut buf = [0u8; 4096];
    loop {
        match read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => sink.data(buf[..n].to_vec()),
            Err(Errno::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EIO) => break,
            Err(e) => {
                error!("PTY read error: {}", e);
                sink.error(TerminalError::Runtime(format!("PTY read failed: {}", e)));
                break;
            }
        }
    }

    let info = match waitpid(child, None) {
        Ok(status) => exit_info(status),
        Err(e) => {
            debug!("waitpid({}) failed: {}", child, e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    running.store(false, Ordering::SeqCst);
    info!("Child {} exited: {:?}", child, info);
    sink.exit(info);
    debug!("Reader thread exiting");
}

fn writer_thread(
    fd: Arc<OwnedFd>,
    closed: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: EventSink,
) {
    let raw: RawFd = fd.as_raw_fd();
    while let Some(data) = rx.blocking_recv() {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let mut written = 0;
        while written < data.len() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            match write(borrowed, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    error!("PTY write error: {}", e);
                    sink.error(TerminalError::Runtime(format!("PTY write failed: {}", e)));
                    break;
                }
            }
        }
    }
    debug!("Writer thread exiting");
}
