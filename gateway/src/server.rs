use crate::codec::{decode_command, Command};
use crate::error::Error;
use crate::handoff::{Assignment, Broadcaster, Shared};
use crate::session::{ConnectedSet, Session, SessionId, SessionRegistry};
use events::Announcement;
use log::*;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;
const EVENTS_CAPACITY: usize = 1024;
const REACTOR_THREAD_NAME: &str = "announce-gateway-reactor";
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub const DEFAULT_PORT: u16 = 6001;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime settings for a [`Gateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub addr: SocketAddr,
    /// Size of the scratch buffer each socket read goes through.
    pub read_buffer_size: usize,
    /// Longest inbound line accepted before it is discarded.
    pub max_frame_len: usize,
    /// Upper bound on how long `close` waits for the reactor thread.
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn with_port(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Self::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// A decoded, valid command received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub session: SessionId,
    pub peer: SocketAddr,
    /// The trimmed frame exactly as the client sent it.
    pub raw: String,
    pub command: Command,
}

/// Callback invoked on the reactor thread for every valid inbound command.
/// It must not block.
pub type InboundConsumer = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct Worker {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

/// A running TCP fan-out gateway.
///
/// One dedicated thread owns the listener, the multiplexer and every
/// session. Other threads interact with it only through [`Broadcaster`]
/// and the diagnostics below. Dropping the gateway closes it.
pub struct Gateway {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_timeout: Duration,
    closed: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl Gateway {
    /// Binds the listener and spawns the reactor thread.
    ///
    /// Bind failures are returned here, before any thread exists.
    pub fn start(settings: Settings, consumer: InboundConsumer) -> Result<Self, Error> {
        let mut listener =
            TcpListener::bind(settings.addr).map_err(|e| Error::bind(settings.addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::bind(settings.addr, e))?;

        let poll = Poll::new().map_err(Error::multiplexer)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(Error::multiplexer)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(Error::multiplexer)?;

        let connected = ConnectedSet::new();
        let (shared, assignments) = Shared::new(waker, connected.clone());
        shared.running.store(true, Ordering::SeqCst);

        let reactor = Reactor {
            poll,
            listener,
            sessions: SessionRegistry::new(connected, FIRST_SESSION_TOKEN),
            assignments,
            consumer,
            shared: Arc::clone(&shared),
            scratch: vec![0; settings.read_buffer_size.max(1)],
            max_frame_len: settings.max_frame_len,
            deferred_reads: Vec::new(),
        };

        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(REACTOR_THREAD_NAME.to_owned())
            .spawn(move || {
                reactor.run();
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                shared.running.store(false, Ordering::SeqCst);
                Error::spawn(e)
            })?;

        info!("Announcement gateway started on {local_addr}");

        Ok(Self {
            shared,
            local_addr,
            shutdown_timeout: settings.shutdown_timeout,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(Worker {
                handle,
                done: done_rx,
            })),
        })
    }

    /// Starts on all interfaces at `port` with default settings.
    pub fn start_on_port(port: u16, consumer: InboundConsumer) -> Result<Self, Error> {
        Self::start(Settings::with_port(port), consumer)
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(Arc::clone(&self.shared))
    }

    /// See [`Broadcaster::broadcast`].
    pub fn broadcast(&self, announcement: &Announcement) -> usize {
        self.broadcaster().broadcast(announcement)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn connected_count(&self) -> usize {
        self.shared.connected.len()
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.shared
            .connected
            .peers()
            .into_iter()
            .map(|(_, peer)| peer)
            .collect()
    }

    /// Stops the reactor and waits for it up to the configured shutdown
    /// timeout. Safe to call more than once and from any thread; failures
    /// are logged, never returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };

        match worker.done.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Gateway reactor thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Gateway reactor did not stop within {:?}, detaching it",
                    self.shutdown_timeout
                );
            }
        }

        info!("Announcement gateway on {} closed", self.local_addr);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}

/// The event loop. Lives entirely on the reactor thread.
struct Reactor {
    poll: Poll,
    listener: TcpListener,
    sessions: SessionRegistry<TcpStream>,
    assignments: tokio::sync::mpsc::UnboundedReceiver<Assignment>,
    consumer: InboundConsumer,
    shared: Arc<Shared>,
    scratch: Vec<u8>,
    max_frame_len: usize,
    // Sessions whose last read stopped at the read budget.
    deferred_reads: Vec<SessionId>,
}

/// Consecutive multiplexer failures. A repeated error is logged once and
/// retried after a pause.
#[derive(Debug, Default)]
struct PollFailures {
    last: Option<ErrorKind>,
    consecutive: u32,
}

impl PollFailures {
    /// Returns whether to log this failure and how long to wait before
    /// polling again.
    fn record(&mut self, kind: ErrorKind) -> (bool, Option<Duration>) {
        self.consecutive += 1;
        let log = self.last != Some(kind);
        self.last = Some(kind);
        let backoff = (self.consecutive > 1).then_some(POLL_ERROR_BACKOFF);
        (log, backoff)
    }

    fn clear(&mut self) {
        self.last = None;
        self.consecutive = 0;
    }
}

impl Reactor {
    fn run(mut self) {
        debug!("Gateway reactor thread started");

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut failures = PollFailures::default();

        while self.shared.is_running() {
            self.apply_assignments();

            // Sessions with unread input must not wait for a new edge.
            let timeout = if self.deferred_reads.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted || !self.shared.is_running() {
                    continue;
                }
                let (log, backoff) = failures.record(e.kind());
                if log {
                    error!("Error in gateway poll loop: {e}");
                }
                if let Some(backoff) = backoff {
                    thread::sleep(backoff);
                }
                continue;
            }
            failures.clear();

            let deferred = std::mem::take(&mut self.deferred_reads);

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => {
                        let id = SessionId::from_token(token);
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.on_readable(id);
                        }
                        if event.is_writable() {
                            self.on_writable(id);
                        }
                    }
                }
            }

            for id in deferred {
                if !self.deferred_reads.contains(&id) {
                    self.on_readable(id);
                }
            }
        }

        self.shutdown();
    }

    /// Applies every queued broadcast. Sessions that went away since the
    /// broadcast was queued are skipped.
    fn apply_assignments(&mut self) {
        while let Ok(Assignment { session: id, frame }) = self.assignments.try_recv() {
            let Some(session) = self.sessions.get_mut(id) else {
                trace!("Skipping broadcast for closed session {id}");
                continue;
            };
            session.assign(frame);
            self.on_writable(id);
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = self
                        .sessions
                        .insert(Session::new(stream, peer, self.max_frame_len));
                    let registered = match self.sessions.get_mut(id) {
                        Some(session) => self.poll.registry().register(
                            session.stream_mut(),
                            id.token(),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!("Failed to register client {peer}: {e}");
                        self.sessions.remove(id);
                        continue;
                    }
                    info!(
                        "Client connected: {peer} (session {id}, total: {})",
                        self.sessions.len()
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to accept gateway client: {e}");
                    break;
                }
            }
        }
    }

    fn on_readable(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let peer = session.peer();

        let outcome = session.read_frames(&mut self.scratch);
        for raw in outcome.frames {
            self.dispatch(id, peer, raw);
        }

        if let Some(e) = outcome.error {
            warn!("Dropping client {peer}: {e}");
            self.close_session(id, "read error");
        } else if outcome.peer_closed {
            self.close_session(id, "peer closed");
        } else if outcome.more && !self.deferred_reads.contains(&id) {
            self.deferred_reads.push(id);
        }
    }

    fn dispatch(&self, id: SessionId, peer: SocketAddr, raw: String) {
        let command = match decode_command(&raw) {
            Ok(command) => command,
            Err(e) => {
                debug!("Discarding malformed frame from {peer}: {e}");
                return;
            }
        };

        debug!("Received from {peer}: {raw}");
        let message = InboundMessage {
            session: id,
            peer,
            raw,
            command,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| (self.consumer)(message))).is_err() {
            error!("Inbound consumer panicked while handling a frame from {peer}");
        }
    }

    fn on_writable(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        match session.flush() {
            Ok(_) => self.sync_interest(id),
            Err(e) => {
                warn!("Dropping client {}: write failed: {e}", session.peer());
                self.close_session(id, "write error");
            }
        }
    }

    /// Re-registers the session if its desired interest changed.
    fn sync_interest(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let wanted = session.interest();
        if wanted == session.registered() {
            return;
        }

        let result = self
            .poll
            .registry()
            .reregister(session.stream_mut(), id.token(), wanted);
        match result {
            Ok(()) => session.set_registered(wanted),
            Err(e) => {
                warn!("Failed to update interest for session {id}: {e}");
                self.close_session(id, "reregister failed");
            }
        }
    }

    fn close_session(&mut self, id: SessionId, reason: &str) {
        if let Some(mut session) = self.sessions.remove(id) {
            if let Err(e) = self.poll.registry().deregister(session.stream_mut()) {
                debug!("Failed to deregister session {id}: {e}");
            }
            info!(
                "Client disconnected: {} ({reason}, total: {})",
                session.peer(),
                self.sessions.len()
            );
        }
    }

    fn shutdown(&mut self) {
        debug!("Closing sessions {:?}", self.sessions.ids());
        let closed = self.sessions.drain().len();
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!("Failed to deregister listener: {e}");
        }
        info!("Gateway reactor stopped, closed {closed} client connection(s)");
    }
}
