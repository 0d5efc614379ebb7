//! Client for a remote terminal daemon over a Unix domain socket.
//!
//! One persistent NDJSON connection per client:
//! - `hello` → `hello_ok` handshake before any other traffic
//! - `spawn` → `spawned`/`error` correlated by a client-generated id
//! - `data`/`exit`/`error` pushed by the daemon, routed by session id
//! - `write`/`resize`/`signal` pushed by the client
//!
//! Session messages that arrive before the matching process object is
//! attached are buffered and replayed on attach.

use crate::codec::{self, NdjsonDecoder};
use crate::config::ProxyConfig;
use crate::driver::{event_channel, DriverEvents, EventSink, ProcessDriver, SpawnRequest};
use crate::error::{Result, TerminalError};
use crate::protocol::{Backend, ExitInfo, WireMessage, PROTOCOL_VERSION};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Signal reported when the socket closes before the daemon sent `exit`
pub const SOCKET_CLOSED: &str = "socket_closed";

/// Early messages kept per unattached session
const MAX_EARLY_MESSAGES: usize = 4096;

const READ_CHUNK: usize = 8192;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SpawnResponder = oneshot::Sender<Result<String>>;

#[derive(Default)]
struct Routes {
    /// Attached processes by session id
    live: HashMap<String, EventSink>,
    /// Messages for sessions nobody attached to yet
    early: HashMap<String, Vec<WireMessage>>,
    /// Sessions that exited, were closed or were abandoned
    finished: HashSet<String>,
    disconnected: bool,
}

struct ClientInner {
    outbound: mpsc::UnboundedSender<WireMessage>,
    pending: Mutex<HashMap<String, SpawnResponder>>,
    routes: Mutex<Routes>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    timeout: Duration,
}

/// Connection to a terminal daemon
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<ClientInner>,
}

impl ProxyClient {
    /// Connect and complete the handshake
    pub async fn connect(config: &ProxyConfig) -> Result<Self> {
        let path = &config.socket_path;
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TerminalError::Connection(format!("cannot connect to {}: {}", path.display(), e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = codec::encode(&WireMessage::Hello {
            version: PROTOCOL_VERSION,
            token: config.token.clone(),
        })?;
        writer
            .write_all(&hello)
            .await
            .map_err(|e| TerminalError::Connection(format!("failed to send hello: {}", e)))?;

        let mut decoder = NdjsonDecoder::<WireMessage>::new();
        let leftover = tokio::time::timeout(config.timeout, await_hello_ok(&mut reader, &mut decoder))
            .await
            .map_err(|_| {
                TerminalError::Handshake(format!("no hello_ok within {:?}", config.timeout))
            })??;

        info!("Connected to terminal daemon at {}", path.display());

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                outbound,
                pending: Mutex::new(HashMap::new()),
                routes: Mutex::new(Routes::default()),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                timeout: config.timeout,
            }),
        };

        for msg in leftover {
            client.inner.dispatch(msg);
        }

        let writer_task = tokio::spawn(writer_loop(writer, outbound_rx));
        let reader_task = tokio::spawn(reader_loop(Arc::clone(&client.inner), reader, decoder));
        lock(&client.inner.tasks).extend([writer_task, reader_task]);

        Ok(client)
    }

    /// Ask the daemon to spawn a process and attach to its session
    pub async fn spawn(&self, request: &SpawnRequest) -> Result<(ProxyProcess, DriverEvents)> {
        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        let sent = self.inner.send(WireMessage::Spawn {
            id: id.clone(),
            cmd: request.command.clone(),
            args: request.args.clone(),
            cwd: request.cwd.as_ref().map(|p| p.to_string_lossy().to_string()),
            env: request.env.clone(),
            cols: request.cols,
            rows: request.rows,
        });
        if let Err(e) = sent {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }
        debug!("Spawn request {} sent for {}", id, request.command);

        let session = match tokio::time::timeout(self.inner.timeout, &mut rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(TerminalError::Connection(
                    "connection closed before spawn response".to_string(),
                ))
            }
            Err(_) => {
                if lock(&self.inner.pending).remove(&id).is_none() {
                    // The reply landed between the deadline and the removal
                    if let Ok(Ok(session)) = rx.try_recv() {
                        self.inner.abandon(&id, session);
                    }
                }
                return Err(TerminalError::Spawn(format!(
                    "no response to spawn {} within {:?}",
                    id, self.inner.timeout
                )));
            }
        };

        info!("Daemon spawned {} as session {}", request.command, session);

        let (sink, events) = event_channel();
        self.inner.attach(&session, sink.clone());

        Ok((
            ProxyProcess {
                client: self.clone(),
                session,
                sink,
                closed: AtomicBool::new(false),
            },
            events,
        ))
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drop the connection without waiting for the daemon
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl ClientInner {
    fn send(&self, msg: WireMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TerminalError::Connection("connection closed".to_string()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| TerminalError::Connection("writer task stopped".to_string()))
    }

    fn attach(&self, session: &str, sink: EventSink) {
        let mut routes = lock(&self.routes);

        let mut finished = false;
        if let Some(buffered) = routes.early.remove(session) {
            debug!(
                "Replaying {} early messages for session {}",
                buffered.len(),
                session
            );
            for msg in buffered {
                finished |= deliver(&sink, msg);
            }
        }

        if finished {
            routes.finished.insert(session.to_string());
            return;
        }
        if routes.disconnected {
            sink.exit(ExitInfo::signaled(SOCKET_CLOSED));
            return;
        }
        routes.live.insert(session.to_string(), sink);
    }

    fn detach(&self, session: &str) {
        let mut routes = lock(&self.routes);
        routes.live.remove(session);
        routes.early.remove(session);
        routes.finished.insert(session.to_string());
    }

    /// Kill a session whose spawn request was already given up on
    fn abandon(&self, id: &str, session: String) {
        warn!(
            "spawned for unknown request {} (session {}), killing it",
            id, session
        );
        {
            let mut routes = lock(&self.routes);
            routes.early.remove(&session);
            routes.finished.insert(session.clone());
        }
        let kill = WireMessage::Signal {
            session,
            signal: Signal::SIGKILL.as_str().to_string(),
        };
        if let Err(e) = self.send(kill) {
            debug!("Could not kill abandoned session: {}", e);
        }
    }

    fn dispatch(&self, msg: WireMessage) {
        match msg {
            WireMessage::HelloOk { .. } => debug!("Ignoring repeated hello_ok"),
            WireMessage::Spawned { id, session } => match lock(&self.pending).remove(&id) {
                Some(responder) => {
                    let _ = responder.send(Ok(session));
                }
                None => self.abandon(&id, session),
            },
            WireMessage::Error {
                id: Some(id),
                session,
                message,
            } if lock(&self.pending).contains_key(&id) => {
                if let Some(responder) = lock(&self.pending).remove(&id) {
                    let _ = responder.send(Err(TerminalError::Spawn(message)));
                }
                if let Some(session) = session {
                    debug!("Spawn error for {} also named session {}", id, session);
                }
            }
            WireMessage::Error {
                session: Some(session),
                id,
                message,
            } => self.route(
                session.clone(),
                WireMessage::Error {
                    id,
                    session: Some(session),
                    message,
                },
            ),
            WireMessage::Error { message, .. } => {
                warn!("Terminal daemon error: {}", message);
            }
            msg @ (WireMessage::Data { .. } | WireMessage::Exit { .. }) => {
                if let Some(session) = msg.session().map(str::to_string) {
                    self.route(session, msg);
                }
            }
            other => warn!("Unexpected message from daemon: {:?}", other),
        }
    }

    fn route(&self, session: String, msg: WireMessage) {
        let mut routes = lock(&self.routes);
        if let Some(sink) = routes.live.get(&session) {
            if deliver(sink, msg) {
                routes.live.remove(&session);
                routes.finished.insert(session);
            }
            return;
        }
        if routes.finished.contains(&session) {
            debug!("Dropping message for finished session {}", session);
            return;
        }

        let queue = routes.early.entry(session.clone()).or_default();
        if queue.len() >= MAX_EARLY_MESSAGES {
            warn!("Dropping early message for unattached session {}", session);
            return;
        }
        debug!("Buffering message for unattached session {}", session);
        queue.push(msg);
    }

    fn connection_lost(&self) {
        self.closed.store(true, Ordering::SeqCst);

        for (id, responder) in lock(&self.pending).drain() {
            debug!("Rejecting pending request {}", id);
            let _ = responder.send(Err(TerminalError::Connection(
                "socket closed before response".to_string(),
            )));
        }

        let mut routes = lock(&self.routes);
        routes.disconnected = true;
        for (session, sink) in routes.live.drain() {
            if sink.exit(ExitInfo::signaled(SOCKET_CLOSED)) {
                info!("Session {} lost with the daemon connection", session);
            }
        }
    }
}

/// Push one session message into a process's event stream.
/// Returns true when it was the exit.
fn deliver(sink: &EventSink, msg: WireMessage) -> bool {
    match msg {
        WireMessage::Data { data_b64, session } => {
            match BASE64.decode(data_b64.as_bytes()) {
                Ok(bytes) => sink.data(bytes),
                Err(e) => {
                    warn!("Bad base64 payload for session {}: {}", session, e);
                    sink.error(TerminalError::protocol(
                        format!("invalid base64 payload: {}", e),
                        data_b64,
                    ));
                }
            }
            false
        }
        WireMessage::Exit { code, signal, .. } => {
            sink.exit(ExitInfo { code, signal });
            true
        }
        WireMessage::Error { message, .. } => {
            sink.error(TerminalError::Runtime(message));
            false
        }
        _ => false,
    }
}

/// Read until `hello_ok`, returning anything decoded after it
async fn await_hello_ok(
    reader: &mut OwnedReadHalf,
    decoder: &mut NdjsonDecoder<WireMessage>,
) -> Result<Vec<WireMessage>> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TerminalError::Handshake(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(TerminalError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }

        let mut messages = decoder
            .feed(&buf[..n], |e| warn!("Malformed frame during handshake: {}", e))
            .into_iter();
        while let Some(msg) = messages.next() {
            match msg {
                WireMessage::HelloOk { version } => {
                    debug!("hello_ok (daemon version {:?})", version);
                    return Ok(messages.collect());
                }
                WireMessage::Error { message, .. } => {
                    return Err(TerminalError::Handshake(message));
                }
                other => warn!("Ignoring {:?} before hello_ok", other),
            }
        }
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(msg) = rx.recv().await {
        let line = match codec::encode(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {:?}: {}", msg, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&line).await {
            warn!("Daemon socket write failed: {}", e);
            break;
        }
    }
    debug!("Proxy writer exiting");
}

async fn reader_loop(
    inner: Arc<ClientInner>,
    mut reader: OwnedReadHalf,
    mut decoder: NdjsonDecoder<WireMessage>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Terminal daemon closed the connection");
                break;
            }
            Ok(n) => {
                let messages =
                    decoder.feed(&buf[..n], |e| warn!("Malformed frame from daemon: {}", e));
                for msg in messages {
                    inner.dispatch(msg);
                }
            }
            Err(e) => {
                warn!("Daemon socket read failed: {}", e);
                break;
            }
        }
    }
    inner.connection_lost();
}

/// A process hosted by the daemon. The session id is fixed at spawn time.
pub struct ProxyProcess {
    client: ProxyClient,
    session: String,
    sink: EventSink,
    closed: AtomicBool,
}

impl ProxyProcess {
    pub fn session(&self) -> &str {
        &self.session
    }

    fn finished(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sink.has_exited()
    }
}

impl ProcessDriver for ProxyProcess {
    fn backend(&self) -> Backend {
        Backend::Proxy
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.finished() {
            debug!("Dropping {} byte write to finished session", data.len());
            return Ok(());
        }
        self.client.inner.send(WireMessage::Write {
            session: self.session.clone(),
            data_b64: BASE64.encode(data),
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.finished() {
            return Ok(());
        }
        self.client.inner.send(WireMessage::Resize {
            session: self.session.clone(),
            cols,
            rows,
        })
    }

    fn kill(&self, signal: Option<Signal>) -> Result<()> {
        if self.finished() {
            return Ok(());
        }
        let signal = signal.unwrap_or(Signal::SIGTERM);
        self.client.inner.send(WireMessage::Signal {
            session: self.session.clone(),
            signal: signal.as_str().to_string(),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.seal();
        self.client.inner.detach(&self.session);
        self.client.shutdown();
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        self.close();
    }
}
