//! agent-pty: run an agent CLI under the terminal control core
//!
//! Prints the agent's stripped output, types each stdin line into it and
//! optionally reports state changes, questions and limits as JSON.
//!
//! Usage:
//!   agent-pty --json-events -- claude --model opus

use agent_pty::config::ENV_TIMEOUT_MS;
use agent_pty::{
    Backend, Config, ExitInfo, PatternConfig, PatternTable, SessionController, TerminalAction,
    TerminalEvent,
};
use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;
use serde_json::json;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal control core for interactive coding agents
#[derive(Parser, Debug)]
#[command(name = "agent-pty")]
#[command(about = "Drive an interactive agent CLI through a PTY or a terminal daemon")]
#[command(version)]
struct Args {
    /// Process backend (local or proxy)
    #[arg(long)]
    backend: Option<Backend>,

    /// Terminal daemon socket path (proxy backend)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Auth token sent to the terminal daemon
    #[arg(long)]
    token: Option<String>,

    /// Handshake and spawn timeout in milliseconds (proxy backend)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Working directory for the agent
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Command typed to ask the agent to quit on a graceful stop
    #[arg(long)]
    exit_command: Option<String>,

    /// JSON file replacing some or all detection patterns
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// Emit non-output events as JSON lines on stderr
    #[arg(long)]
    json_events: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    /// Environment first, flags on top
    fn config(&self) -> Result<Config> {
        let mut config = Config::from_env().context("Invalid environment configuration")?;
        if let Some(backend) = self.backend {
            config.backend = backend;
            config.backend_env_override = false;
        }
        if let Some(ref socket) = self.socket {
            config.proxy.socket_path = socket.clone();
        }
        if let Some(ref token) = self.token {
            config.proxy.token = Some(token.clone());
        }
        if let Some(ms) = self.timeout_ms {
            debug!("--timeout-ms overrides {}", ENV_TIMEOUT_MS);
            config.proxy.timeout = Duration::from_millis(ms);
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }
        if let Some(ref cwd) = self.cwd {
            config.cwd = Some(cwd.clone());
        }
        if let Some(ref exit_command) = self.exit_command {
            config.exit_command = exit_command.clone();
        }
        Ok(config)
    }

    fn pattern_table(&self) -> Result<PatternTable> {
        match self.patterns {
            Some(ref path) => {
                let overrides = PatternConfig::load(path)
                    .with_context(|| format!("Failed to read patterns from {}", path.display()))?;
                PatternTable::from_config(&overrides).context("Invalid pattern file")
            }
            None => Ok(PatternTable::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("agent-pty v{}", env!("CARGO_PKG_VERSION"));
    info!("Command: {:?}", args.command);

    let config = args.config()?;
    let patterns = Arc::new(args.pattern_table()?);
    info!(
        "Backend: {}, terminal size: {}x{}",
        config.resolve_backend()?,
        config.cols,
        config.rows
    );

    let controller = SessionController::with_patterns(config, patterns);
    let mut events = controller.subscribe();

    let (program, program_args) = args
        .command
        .split_first()
        .context("No command given")?;
    controller
        .start(program, program_args)
        .await
        .context("Failed to start agent")?;

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;

    // Stdin lines become `send` actions
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if stdin_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    let mut stopping = false;
    let mut exit: Option<ExitInfo> = None;

    loop {
        select! {
            _ = sigint.recv() => {
                info!("SIGINT received, forwarding Ctrl+C");
                let result = controller.execute_action(&TerminalAction::CtrlC).await;
                if !result.success {
                    warn!("Ctrl+C not delivered: {}", result.error.unwrap_or_default());
                }
            }

            _ = sigterm.recv(), if !stopping => {
                info!("SIGTERM received");
                stopping = true;
                controller.stop(false).await;
            }

            _ = sigwinch.recv() => {
                if let Some((rows, cols)) = get_terminal_size() {
                    if let Err(e) = controller.resize(cols, rows).await {
                        debug!("Resize skipped: {}", e);
                    }
                }
            }

            line = stdin_rx.recv(), if stdin_open => match line {
                Some(content) => {
                    let result = controller.execute_action(&TerminalAction::Send { content }).await;
                    if !result.success {
                        warn!("Input rejected: {}", result.error.unwrap_or_default());
                    }
                }
                None => {
                    info!("stdin closed");
                    stdin_open = false;
                    if !stopping {
                        stopping = true;
                        controller.stop(false).await;
                    }
                }
            },

            event = events.recv() => match event {
                Ok(TerminalEvent::Output(text)) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Ok(event) => {
                    if args.json_events {
                        eprintln!("{}", event_json(&event));
                    }
                    if let TerminalEvent::Exit(info) = event {
                        exit = Some(info);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    // A child that exited on its own leaves nothing to stop
    controller.stop(true).await;

    let code = exit.as_ref().map(exit_code).unwrap_or(0);
    match exit {
        Some(info) => info!("Agent exited (code {:?}, signal {:?})", info.code, info.signal),
        None => error!("Event stream closed before the agent exited"),
    }
    info!("Goodbye!");
    std::process::exit(code);
}

/// One JSON line per non-output event
fn event_json(event: &TerminalEvent) -> serde_json::Value {
    match event {
        TerminalEvent::Output(text) => json!({ "event": "output", "text": text }),
        TerminalEvent::StateChange { from, to } => {
            json!({ "event": "state_change", "from": from, "to": to })
        }
        TerminalEvent::Question(text) => json!({ "event": "question", "text": text }),
        TerminalEvent::LimitReached(reset_at) => {
            json!({ "event": "limit_reached", "reset_at": reset_at })
        }
        TerminalEvent::Exit(info) => {
            json!({ "event": "exit", "code": info.code, "signal": info.signal })
        }
        TerminalEvent::Error(err) => json!({ "event": "error", "message": err.to_string() }),
    }
}

/// Shell convention: the exit code, or 128 + signal number
fn exit_code(info: &ExitInfo) -> i32 {
    if let Some(code) = info.code {
        return code;
    }
    info.signal
        .as_deref()
        .and_then(|name| name.parse::<Signal>().ok())
        .map(|sig| 128 + sig as i32)
        .unwrap_or(1)
}

/// Get current terminal size
fn get_terminal_size() -> Option<(u16, u16)> {
    use nix::libc;
    use nix::pty::Winsize;

    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    unsafe {
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0 {
            Some((winsize.ws_row, winsize.ws_col))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(&ExitInfo::code(7)), 7);
        assert_eq!(exit_code(&ExitInfo::signaled("SIGKILL")), 137);
        assert_eq!(exit_code(&ExitInfo::signaled("socket_closed")), 1);
    }

    #[test]
    fn test_flags_override_environment() {
        let args = Args::parse_from([
            "agent-pty",
            "--backend",
            "proxy",
            "--cols",
            "80",
            "--exit-command",
            "quit",
            "--",
            "claude",
        ]);
        let config = args.config().unwrap();
        assert_eq!(config.backend, Backend::Proxy);
        assert!(!config.backend_env_override);
        assert_eq!(config.cols, 80);
        assert_eq!(config.exit_command, "quit");
        assert_eq!(args.command, vec!["claude"]);
    }

    #[test]
    fn test_event_json_shape() {
        let value = event_json(&TerminalEvent::StateChange {
            from: agent_pty::TerminalState::Processing,
            to: agent_pty::TerminalState::Question,
        });
        assert_eq!(value["event"], "state_change");
        assert_eq!(value["to"], "question");
    }
}
