//! Session controller: one driven agent process and its semantic state.
//!
//! All session fields live behind one async mutex. A single pump task per
//! session applies driver events; events are broadcast while the lock is
//! held so a `StateChange` is published before anyone can observe the new
//! state through the controller.

use crate::config::Config;
use crate::driver::{DriverEvent, DriverEvents, ProcessDriver, SpawnRequest};
use crate::error::{Result, TerminalError};
use crate::parser::{self, AnsiStripper, Detection, OutputBuffer, ANALYSIS_LINES};
use crate::patterns::{resolve_reset_time, PatternTable};
use crate::protocol::{
    ActionResult, Backend, ExitInfo, IdleWait, TerminalAction, TerminalEvent,
    TerminalObservation, TerminalState,
};
use crate::proxy::ProxyClient;
use crate::pty::LocalPty;
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Signal reported when a stop ends a process that never reported its exit
pub const STOPPED: &str = "stopped";

const EVENT_CAPACITY: usize = 1024;
const CTRL_C_SETTLE: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(500);

struct Inner {
    state: TerminalState,
    /// Bumped by every start and cleanup; stale pumps compare against it
    generation: u64,
    driver: Option<Arc<dyn ProcessDriver>>,
    backend: Option<Backend>,
    started_at: Option<Instant>,
    last_action: Option<Instant>,
    last_output: Option<Instant>,
    last_question: Option<String>,
    limit_reset_time: Option<DateTime<Local>>,
    buffer: OutputBuffer,
    stripper: AnsiStripper,
    cols: u16,
    rows: u16,
    exit_reported: bool,
}

impl Inner {
    fn new(config: &Config, generation: u64) -> Self {
        Self {
            state: TerminalState::Idle,
            generation,
            driver: None,
            backend: None,
            started_at: None,
            last_action: None,
            last_output: None,
            last_question: None,
            limit_reset_time: None,
            buffer: OutputBuffer::new(config.max_buffer_size),
            stripper: AnsiStripper::new(),
            cols: config.cols,
            rows: config.rows,
            exit_reported: false,
        }
    }

    fn set_state(&mut self, to: TerminalState, events: &broadcast::Sender<TerminalEvent>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!("State {} -> {}", from, to);
        let _ = events.send(TerminalEvent::StateChange { from, to });
    }
}

struct Shared {
    config: Config,
    patterns: Arc<PatternTable>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TerminalEvent>,
}

/// Drives one agent process and tracks what it is doing
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(config: Config) -> Self {
        Self::with_patterns(config, Arc::new(PatternTable::default()))
    }

    pub fn with_patterns(config: Config, patterns: Arc<PatternTable>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner::new(&config, 0);
        Self {
            shared: Arc::new(Shared {
                config,
                patterns,
                inner: Mutex::new(inner),
                events,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: TerminalEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Spawn `command` on the configured backend. Only valid from `idle`.
    pub async fn start(&self, command: &str, args: &[String]) -> Result<()> {
        {
            let inner = self.shared.inner.lock().await;
            if inner.state != TerminalState::Idle {
                return Err(TerminalError::InvalidState {
                    state: inner.state,
                    reason: "a session is already active",
                });
            }
        }

        let config = &self.shared.config;
        let request = SpawnRequest {
            command: command.to_string(),
            args: args.to_vec(),
            cwd: config.cwd.clone(),
            env: config.merged_env(),
            cols: config.cols,
            rows: config.rows,
        };

        match self.spawn_driver(&request).await {
            Ok((driver, events)) => self.start_with_driver(driver, events).await,
            Err(e) => {
                warn!("Failed to start {}: {}", command, e);
                let mut inner = self.shared.inner.lock().await;
                if inner.state == TerminalState::Idle {
                    inner.set_state(TerminalState::Error, &self.shared.events);
                }
                Err(e)
            }
        }
    }

    async fn spawn_driver(
        &self,
        request: &SpawnRequest,
    ) -> Result<(Arc<dyn ProcessDriver>, DriverEvents)> {
        let config = &self.shared.config;
        match config.resolve_backend()? {
            Backend::Local => {
                let (pty, events) = LocalPty::spawn(request, config.pty_helper.as_deref())?;
                let driver: Arc<dyn ProcessDriver> = Arc::new(pty);
                Ok((driver, events))
            }
            Backend::Proxy => {
                let client = ProxyClient::connect(&config.proxy).await?;
                match client.spawn(request).await {
                    Ok((process, events)) => {
                        let driver: Arc<dyn ProcessDriver> = Arc::new(process);
                        Ok((driver, events))
                    }
                    Err(e) => {
                        client.shutdown();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Take over an already running driver. Only valid from `idle`.
    pub async fn start_with_driver(
        &self,
        driver: Arc<dyn ProcessDriver>,
        events: DriverEvents,
    ) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != TerminalState::Idle {
            driver.close();
            return Err(TerminalError::InvalidState {
                state: inner.state,
                reason: "a session is already active",
            });
        }

        let backend = driver.backend();
        inner.generation += 1;
        let generation = inner.generation;
        inner.driver = Some(driver);
        inner.backend = Some(backend);
        inner.started_at = Some(Instant::now());
        inner.exit_reported = false;
        inner.set_state(TerminalState::Starting, &self.shared.events);

        tokio::spawn(self.clone().pump(generation, events));
        info!("Session started on {} backend", backend);
        Ok(())
    }

    async fn pump(self, generation: u64, mut events: DriverEvents) {
        while let Some(event) = events.recv().await {
            let mut inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                break;
            }
            match event {
                DriverEvent::Data(bytes) => self.apply_output(&mut inner, &bytes),
                DriverEvent::Error(err) => {
                    warn!("Driver error: {}", err);
                    self.emit(TerminalEvent::Error(Arc::new(err)));
                }
                DriverEvent::Exit(info) => {
                    info!("Process exited (code {:?}, signal {:?})", info.code, info.signal);
                    inner.exit_reported = true;
                    self.emit(TerminalEvent::Exit(info));
                    self.cleanup(&mut inner);
                    break;
                }
            }
        }
        debug!("Event pump {} finished", generation);
    }

    /// Buffer a chunk and run the detection rules over the new tail
    fn apply_output(&self, inner: &mut Inner, bytes: &[u8]) {
        inner.last_output = Some(Instant::now());
        let text = inner.stripper.push(bytes);
        if !text.is_empty() {
            inner.buffer.push(&text);
            self.emit(TerminalEvent::Output(text));
        }

        // Output during a stop is kept but cannot move the state
        if matches!(
            inner.state,
            TerminalState::Stopping | TerminalState::Idle | TerminalState::Error
        ) {
            return;
        }

        let lines = inner.buffer.lines_since_mark(ANALYSIS_LINES);
        let detection = parser::detect(&lines, &self.shared.patterns);
        let events = &self.shared.events;

        match detection {
            Detection::Question(question) => {
                let announce = inner.state != TerminalState::Question
                    || inner.last_question.as_deref() != Some(question.as_str());
                inner.last_question = Some(question.clone());
                inner.set_state(TerminalState::Question, events);
                if announce {
                    info!("Question detected: {}", question);
                    self.emit(TerminalEvent::Question(question));
                }
            }
            Detection::Ready => inner.set_state(TerminalState::Ready, events),
            Detection::LimitReached { reset_token } => {
                let entering = inner.state != TerminalState::LimitReached;
                let reset_at = resolve_reset_time(reset_token.as_deref(), Local::now());
                inner.limit_reset_time = Some(reset_at);
                inner.set_state(TerminalState::LimitReached, events);
                if entering {
                    info!("Usage limit reached, resets at {}", reset_at);
                    self.emit(TerminalEvent::LimitReached(Some(reset_at)));
                }
            }
            Detection::Nothing => {
                if !bytes.is_empty()
                    && matches!(
                        inner.state,
                        TerminalState::WaitingResponse | TerminalState::Starting
                    )
                {
                    inner.set_state(TerminalState::Processing, events);
                }
            }
        }
    }

    /// Close the driver and reset every session field back to `idle`
    fn cleanup(&self, inner: &mut Inner) {
        if let Some(driver) = inner.driver.take() {
            driver.close();
            if !inner.exit_reported {
                self.emit(TerminalEvent::Exit(ExitInfo::signaled(STOPPED)));
            }
        }
        inner.set_state(TerminalState::Idle, &self.shared.events);
        *inner = Inner::new(&self.shared.config, inner.generation + 1);
    }

    /// Stop the session. Graceful unless `force`; always ends in `idle`.
    pub async fn stop(&self, force: bool) {
        let mut rx = self.subscribe();
        let (driver, generation) = {
            let mut inner = self.shared.inner.lock().await;
            let state = inner.state;
            match state {
                TerminalState::Idle => return,
                TerminalState::Stopping => {
                    drop(inner);
                    let limit = self.shared.config.stop_timeout + KILL_GRACE * 2;
                    let _ = self.wait_for_state(&[TerminalState::Idle], limit).await;
                    return;
                }
                _ => {}
            }
            inner.set_state(TerminalState::Stopping, &self.shared.events);
            match inner.driver.clone() {
                Some(driver) => (driver, inner.generation),
                None => {
                    self.cleanup(&mut inner);
                    return;
                }
            }
        };

        let mut exited = false;
        if !force {
            info!("Stopping session gracefully");
            if let Err(e) = driver.write(&[0x03]) {
                debug!("Ctrl+C during stop failed: {}", e);
            }
            tokio::time::sleep(CTRL_C_SETTLE).await;
            let exit_line = format!("{}\r", self.shared.config.exit_command);
            if let Err(e) = driver.write(exit_line.as_bytes()) {
                debug!("Exit command during stop failed: {}", e);
            }
            exited = tokio::time::timeout(self.shared.config.stop_timeout, wait_for_exit(&mut rx))
                .await
                .is_ok();
            if !exited {
                warn!(
                    "Process did not exit within {:?}, killing",
                    self.shared.config.stop_timeout
                );
            }
        }

        if !exited {
            if let Err(e) = driver.kill(Some(Signal::SIGKILL)) {
                warn!("Kill during stop failed: {}", e);
            }
            let _ = tokio::time::timeout(KILL_GRACE, wait_for_exit(&mut rx)).await;
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.generation == generation {
            self.cleanup(&mut inner);
        }
        info!("Session stopped");
    }

    /// Run one action against the process
    pub async fn execute_action(&self, action: &TerminalAction) -> ActionResult {
        let mut inner = self.shared.inner.lock().await;
        let driver = match (&inner.driver, inner.state.accepts_actions()) {
            (Some(driver), true) => Arc::clone(driver),
            _ => {
                return ActionResult::failed(format!(
                    "cannot {} in state {}",
                    action.kind(),
                    inner.state
                ))
            }
        };

        if let Some(content) = action.content() {
            if let Some(pattern) = self.shared.patterns.contains_dangerous_pattern(content) {
                let err = TerminalError::SafetyViolation {
                    pattern: pattern.to_string(),
                };
                warn!("Blocked {} action: {}", action.kind(), err);
                let message = err.to_string();
                self.emit(TerminalEvent::Error(Arc::new(err)));
                return ActionResult::failed(message);
            }
        }

        if let TerminalAction::Wait { ms } = action {
            let generation = inner.generation;
            drop(inner);
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            let mut inner = self.shared.inner.lock().await;
            if inner.generation == generation {
                inner.last_action = Some(Instant::now());
            }
            return ActionResult::ok();
        }

        if let Err(e) = driver.write(&action.encode()) {
            warn!("Write for {} action failed: {}", action.kind(), e);
            let message = e.to_string();
            self.emit(TerminalEvent::Error(Arc::new(e)));
            return ActionResult::failed(message);
        }

        inner.last_action = Some(Instant::now());
        if matches!(action, TerminalAction::Answer { .. }) {
            inner.last_question = None;
        }
        if action.submits() {
            inner.buffer.mark_submission();
            inner.set_state(TerminalState::WaitingResponse, &self.shared.events);
        }
        debug!("Executed {} action", action.kind());
        ActionResult::ok()
    }

    /// Snapshot of the session as an agent would look at it
    pub async fn observation(&self) -> TerminalObservation {
        let inner = self.shared.inner.lock().await;
        let config = &self.shared.config;
        let now = Instant::now();
        let millis = |since: Instant| now.duration_since(since).as_millis() as u64;

        TerminalObservation {
            state: inner.state,
            recent_output: inner.buffer.tail(config.observation_window_size).to_string(),
            prompt_visible: parser::prompt_visible(&inner.buffer, &self.shared.patterns),
            last_question: inner.last_question.clone(),
            limit_reset_time: inner.limit_reset_time,
            elapsed_ms: inner.started_at.map(millis).unwrap_or(0),
            since_last_action_ms: inner.last_action.map(millis),
            buffer_lines: inner.buffer.line_count(),
            is_streaming: inner
                .last_output
                .map(|t| now.duration_since(t) < config.streaming_timeout)
                .unwrap_or(false),
        }
    }

    pub async fn state(&self) -> TerminalState {
        self.shared.inner.lock().await.state
    }

    pub async fn backend(&self) -> Option<Backend> {
        self.shared.inner.lock().await.backend
    }

    /// Current terminal geometry as (cols, rows)
    pub async fn size(&self) -> (u16, u16) {
        let inner = self.shared.inner.lock().await;
        (inner.cols, inner.rows)
    }

    pub async fn full_buffer(&self) -> String {
        self.shared.inner.lock().await.buffer.as_str().to_string()
    }

    pub async fn clear_buffer(&self) {
        self.shared.inner.lock().await.buffer.clear();
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let driver = inner.driver.clone().ok_or(TerminalError::InvalidState {
            state: inner.state,
            reason: "no running process",
        })?;
        driver.resize(cols, rows)?;
        inner.cols = cols;
        inner.rows = rows;
        debug!("Resized to {}x{}", cols, rows);
        Ok(())
    }

    /// Wait until the state is one of `targets`. Returns the state reached,
    /// or `None` on timeout.
    pub async fn wait_for_state(
        &self,
        targets: &[TerminalState],
        timeout: Duration,
    ) -> Option<TerminalState> {
        let mut rx = self.subscribe();
        let current = self.state().await;
        if targets.contains(&current) {
            return Some(current);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(TerminalEvent::StateChange { to, .. }) if targets.contains(&to) => {
                        return Some(to)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let current = self.state().await;
                        if targets.contains(&current) {
                            return Some(current);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Wait until `pattern` matches buffered or newly arriving output
    pub async fn wait_for_output(&self, pattern: &Regex, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        if pattern.is_match(&self.full_buffer().await) {
            return true;
        }

        let wait = async {
            let mut seen = String::new();
            loop {
                match rx.recv().await {
                    Ok(TerminalEvent::Output(chunk)) => {
                        seen.push_str(&chunk);
                        if pattern.is_match(&seen) {
                            return true;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        seen = self.full_buffer().await;
                        if pattern.is_match(&seen) {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Wait for `idle` without any output. Each output event restarts the
    /// quiet period; gives up after `timeout`.
    pub async fn wait_for_idle(&self, idle: Duration, timeout: Duration) -> IdleWait {
        let mut rx = self.subscribe();
        let deadline = Instant::now() + timeout;
        let mut quiet_until = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(quiet_until.min(deadline)) => {
                    let idle = quiet_until <= deadline;
                    return IdleWait { idle, timed_out: !idle };
                }
                event = rx.recv() => match event {
                    Ok(TerminalEvent::Output(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        quiet_until = Instant::now() + idle;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return IdleWait { idle: false, timed_out: false };
                    }
                }
            }
        }
    }
}

async fn wait_for_exit(rx: &mut broadcast::Receiver<TerminalEvent>) {
    loop {
        match rx.recv().await {
            Ok(TerminalEvent::Exit(_)) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{event_channel, EventSink};
    use std::sync::Mutex as StdMutex;

    /// Records writes; exits when killed
    struct FakeDriver {
        sink: EventSink,
        writes: StdMutex<Vec<Vec<u8>>>,
        closed: StdMutex<bool>,
        exit_on_kill: bool,
        /// Output produced in response to Ctrl+C
        ctrl_c_reply: Option<&'static [u8]>,
    }

    impl FakeDriver {
        fn written(&self) -> Vec<u8> {
            self.writes.lock().unwrap().concat()
        }
    }

    impl ProcessDriver for FakeDriver {
        fn backend(&self) -> Backend {
            Backend::Local
        }

        fn write(&self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            if let (Some(reply), [0x03]) = (self.ctrl_c_reply, data) {
                self.sink.data(reply.to_vec());
            }
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }

        fn kill(&self, signal: Option<Signal>) -> Result<()> {
            if self.exit_on_kill {
                let name = signal.unwrap_or(Signal::SIGTERM).as_str();
                self.sink.exit(ExitInfo::signaled(name));
            }
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn fake(
        sink: EventSink,
        exit_on_kill: bool,
        ctrl_c_reply: Option<&'static [u8]>,
    ) -> FakeDriver {
        FakeDriver {
            sink,
            writes: StdMutex::new(Vec::new()),
            closed: StdMutex::new(false),
            exit_on_kill,
            ctrl_c_reply,
        }
    }

    async fn started(exit_on_kill: bool) -> (SessionController, Arc<FakeDriver>, EventSink) {
        started_with(exit_on_kill, None).await
    }

    async fn started_with(
        exit_on_kill: bool,
        ctrl_c_reply: Option<&'static [u8]>,
    ) -> (SessionController, Arc<FakeDriver>, EventSink) {
        let (sink, events) = event_channel();
        let driver = Arc::new(fake(sink.clone(), exit_on_kill, ctrl_c_reply));
        let mut config = Config::default();
        config.stop_timeout = Duration::from_millis(200);
        let controller = SessionController::new(config);
        controller
            .start_with_driver(driver.clone(), events)
            .await
            .unwrap();
        (controller, driver, sink)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_question_detection_after_processing() {
        let (controller, driver, sink) = started(true).await;
        let mut rx = controller.subscribe();

        let result = controller
            .execute_action(&TerminalAction::Send {
                content: "refactor the parser".to_string(),
            })
            .await;
        assert!(result.success);
        assert_eq!(driver.written(), b"refactor the parser\r");
        assert_eq!(controller.state().await, TerminalState::WaitingResponse);

        sink.data(b"Reading src/parser.rs\n".to_vec());
        assert_eq!(
            controller
                .wait_for_state(&[TerminalState::Processing], WAIT)
                .await,
            Some(TerminalState::Processing)
        );

        sink.data(b"\x1b[1m  Do you want to proceed? [y/n]\x1b[0m\n".to_vec());
        assert_eq!(
            controller
                .wait_for_state(&[TerminalState::Question], WAIT)
                .await,
            Some(TerminalState::Question)
        );

        let obs = controller.observation().await;
        assert_eq!(
            obs.last_question.as_deref(),
            Some("Do you want to proceed? [y/n]")
        );

        let mut questions = 0;
        while let Ok(event) = rx.try_recv() {
            if let TerminalEvent::Question(q) = event {
                assert_eq!(q, "Do you want to proceed? [y/n]");
                questions += 1;
            }
        }
        assert_eq!(questions, 1);

        let result = controller
            .execute_action(&TerminalAction::Answer {
                content: "y".to_string(),
            })
            .await;
        assert!(result.success);
        assert_eq!(controller.state().await, TerminalState::WaitingResponse);
        assert_eq!(controller.observation().await.last_question, None);

        // The answered question is still on screen but must not re-trigger
        sink.data(b"Applying changes\n".to_vec());
        assert_eq!(
            controller
                .wait_for_state(&[TerminalState::Processing], WAIT)
                .await,
            Some(TerminalState::Processing)
        );
    }

    #[tokio::test]
    async fn test_safety_violation_keeps_state() {
        let (controller, driver, _sink) = started(true).await;
        let mut rx = controller.subscribe();

        let result = controller
            .execute_action(&TerminalAction::Send {
                content: "rm -rf /".to_string(),
            })
            .await;
        assert!(!result.success);
        assert!(driver.written().is_empty());
        assert_eq!(controller.state().await, TerminalState::Starting);
        assert!(matches!(
            rx.try_recv(),
            Ok(TerminalEvent::Error(e)) if matches!(*e, TerminalError::SafetyViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_actions_refused_when_idle() {
        let controller = SessionController::new(Config::default());
        let result = controller.execute_action(&TerminalAction::Enter).await;
        assert!(!result.success);
        assert_eq!(controller.state().await, TerminalState::Idle);
        assert!(controller.resize(80, 24).await.is_err());
    }

    #[tokio::test]
    async fn test_start_refused_when_active() {
        let (controller, _driver, _sink) = started(true).await;
        let (other_sink, events) = event_channel();
        let other = Arc::new(fake(other_sink, true, None));
        let err = controller
            .start_with_driver(other.clone(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, TerminalError::InvalidState { .. }));
        assert!(*other.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_forced_stop_reports_exit_once() {
        let (controller, driver, _sink) = started(true).await;
        let mut rx = controller.subscribe();

        controller.stop(true).await;
        assert_eq!(controller.state().await, TerminalState::Idle);
        assert!(*driver.closed.lock().unwrap());

        let mut exits = Vec::new();
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                TerminalEvent::Exit(info) => exits.push(info),
                TerminalEvent::StateChange { to, .. } => states.push(to),
                _ => {}
            }
        }
        assert_eq!(exits, vec![ExitInfo::signaled("SIGKILL")]);
        assert_eq!(states, vec![TerminalState::Stopping, TerminalState::Idle]);

        let result = controller.execute_action(&TerminalAction::CtrlC).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_graceful_stop_synthesizes_exit() {
        // Ignores Ctrl+C, /exit and SIGKILL alike
        let (controller, driver, _sink) = started(false).await;
        let mut rx = controller.subscribe();

        controller.stop(false).await;
        assert_eq!(controller.state().await, TerminalState::Idle);
        assert_eq!(driver.written(), b"\x03/exit\r");

        let exits: Vec<ExitInfo> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                TerminalEvent::Exit(info) => Some(info),
                _ => None,
            })
            .collect();
        assert_eq!(exits, vec![ExitInfo::signaled(STOPPED)]);
    }

    #[tokio::test]
    async fn test_output_during_stop_keeps_stopping() {
        // Agent redraws its prompt when interrupted, then ignores everything
        let (controller, _driver, _sink) = started_with(false, Some(&b"^C\n> "[..])).await;

        let stopper = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.stop(false).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(controller.state().await, TerminalState::Stopping);
        assert!(controller.full_buffer().await.contains("> "));
        let result = controller
            .execute_action(&TerminalAction::Send {
                content: "more work".to_string(),
            })
            .await;
        assert!(!result.success);

        stopper.await.unwrap();
        assert_eq!(controller.state().await, TerminalState::Idle);
    }

    #[tokio::test]
    async fn test_process_exit_returns_to_idle() {
        let (controller, _driver, sink) = started(true).await;
        sink.data(b"partial output".to_vec());
        sink.exit(ExitInfo::code(0));

        assert_eq!(
            controller.wait_for_state(&[TerminalState::Idle], WAIT).await,
            Some(TerminalState::Idle)
        );
        assert!(controller.full_buffer().await.is_empty());
        assert_eq!(controller.observation().await.elapsed_ms, 0);
    }

    #[tokio::test]
    async fn test_limit_reached_sets_reset_time() {
        let (controller, _driver, sink) = started(true).await;
        let mut rx = controller.subscribe();

        sink.data(b"Usage limit reached. Resets at 2pm.\n".to_vec());
        assert_eq!(
            controller
                .wait_for_state(&[TerminalState::LimitReached], WAIT)
                .await,
            Some(TerminalState::LimitReached)
        );

        let reset = controller.observation().await.limit_reset_time.unwrap();
        assert!(reset > Local::now());
        let limit_event = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                TerminalEvent::LimitReached(at) => Some(at),
                _ => None,
            });
        assert_eq!(limit_event, Some(Some(reset)));
    }

    #[tokio::test]
    async fn test_prompt_means_ready() {
        let (controller, _driver, sink) = started(true).await;
        sink.data(b"Welcome back\n\x1b[2K> ".to_vec());
        assert_eq!(
            controller.wait_for_state(&[TerminalState::Ready], WAIT).await,
            Some(TerminalState::Ready)
        );
        assert!(controller.observation().await.prompt_visible);
    }

    #[tokio::test]
    async fn test_wait_for_output_sees_new_chunks() {
        let (controller, _driver, sink) = started(true).await;
        let pattern = Regex::new(r"build \w+ed").unwrap();

        let waiter = {
            let controller = controller.clone();
            let pattern = pattern.clone();
            tokio::spawn(async move { controller.wait_for_output(&pattern, WAIT).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.data(b"build ".to_vec());
        sink.data(b"finished\n".to_vec());
        assert!(waiter.await.unwrap());

        let missing = Regex::new("never printed").unwrap();
        assert!(
            !controller
                .wait_for_output(&missing, Duration::from_millis(100))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_idle_debounces_output() {
        let (controller, _driver, sink) = started(true).await;

        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(150)).await;
                sink.data(b"tick\n".to_vec());
            }
            sink
        });

        let started_at = Instant::now();
        let waited = controller
            .wait_for_idle(Duration::from_millis(300), Duration::from_millis(3000))
            .await;
        assert_eq!(
            waited,
            IdleWait {
                idle: true,
                timed_out: false
            }
        );
        assert!(started_at.elapsed() >= Duration::from_millis(700));
        let sink = feeder.await.unwrap();

        let chatter = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                sink.data(b"still going\n".to_vec());
            }
        });
        let waited = controller
            .wait_for_idle(Duration::from_millis(300), Duration::from_millis(1000))
            .await;
        assert_eq!(
            waited,
            IdleWait {
                idle: false,
                timed_out: true
            }
        );
        chatter.abort();
    }

    #[tokio::test]
    async fn test_observation_window_and_clear() {
        let (controller, _driver, sink) = started(true).await;
        let line = "x".repeat(100);
        for _ in 0..40 {
            sink.data(format!("{}\n", line).into_bytes());
        }
        assert!(
            controller
                .wait_for_idle(Duration::from_millis(100), WAIT)
                .await
                .idle
        );

        let obs = controller.observation().await;
        assert!(obs.recent_output.len() <= controller.config().observation_window_size);
        assert_eq!(obs.buffer_lines, 40);
        assert!(obs.is_streaming);

        controller.clear_buffer().await;
        assert!(controller.full_buffer().await.is_empty());
    }
}
