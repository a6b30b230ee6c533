//! Scripted peers: mock servers a client-under-test talks to.
//!
//! One [`PeerHandle`] owns a listener thread that spawns one handler
//! thread per accepted connection. All handlers of a peer share one
//! [`PeerState`], which the coordinator reads after shutdown.

use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::case::{Protocol, Scenario, TestMode};

pub mod chatroom;
pub mod lockstep;
pub mod scripted;
pub mod udp;

pub use chatroom::ChatroomPeer;
pub use lockstep::{MultiStepPeer, StopAndWaitPeer};
pub use scripted::ScriptedPeer;

/// How long `shutdown` waits for the listener and live handlers.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Append-only logs written by every handler of one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLog {
    pub received: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PeerState {
    log: Mutex<PeerLog>,
}

impl PeerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, PeerLog> {
        self.log.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn record_received(&self, data: impl Into<String>) {
        self.lock().received.push(data.into());
    }

    pub fn record_error(&self, err: impl Into<String>) {
        let err = err.into();
        debug!(%err, "peer error recorded");
        self.lock().errors.push(err);
    }

    pub fn snapshot(&self) -> PeerLog {
        self.lock().clone()
    }
}

/// Behaviour of a TCP peer for one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: TcpStream, state: &PeerState) -> io::Result<()>;
}

/// Counts live handler threads so shutdown can wait for them.
#[derive(Debug, Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn enter(&self) {
        *self.count.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }
    fn leave(&self) {
        let mut n = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *n = n.saturating_sub(1);
        self.idle.notify_all();
    }
    fn wait_idle(&self, grace: Duration) -> bool {
        let n = self.count.lock().unwrap_or_else(|p| p.into_inner());
        let (n, _) = self
            .idle
            .wait_timeout_while(n, grace, |n| *n > 0)
            .unwrap_or_else(|p| p.into_inner());
        *n == 0
    }
}

/// A running peer. Dropping it without `shutdown` leaks the listener thread
/// until the process exits.
pub struct PeerHandle {
    port: u16,
    state: Arc<PeerState>,
    stop: Arc<AtomicBool>,
    inflight: Arc<Inflight>,
    done: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &Arc<PeerState> {
        &self.state
    }

    /// Stop accepting, give the listener and live handlers a bounded grace
    /// period, then return what was recorded.
    pub fn shutdown(mut self) -> PeerLog {
        self.stop.store(true, Ordering::Relaxed);
        match self.done.recv_timeout(SHUTDOWN_GRACE) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(t) = self.thread.take() {
                    let _ = t.join();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(port = self.port, "peer listener did not stop in time");
            }
        }
        if !self.inflight.wait_idle(SHUTDOWN_GRACE) {
            warn!(port = self.port, "peer handlers still running at shutdown");
        }
        info!(port = self.port, "peer stopped");
        self.state.snapshot()
    }
}

/// Serve `handler` on `127.0.0.1:port`, one thread per connection.
///
/// `io_timeout` bounds every read and write on accepted connections.
pub fn start_tcp(
    port: u16,
    handler: Arc<dyn ConnectionHandler>,
    io_timeout: Duration,
) -> io::Result<PeerHandle> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;

    let state = PeerState::new();
    let stop = Arc::new(AtomicBool::new(false));
    let inflight = Arc::new(Inflight::default());
    let (done_tx, done) = mpsc::channel();

    let thread = {
        let state = state.clone();
        let stop = stop.clone();
        let inflight = inflight.clone();
        thread::Builder::new()
            .name(format!("peer-{port}"))
            .spawn(move || {
                accept_loop(listener, handler, state, stop, inflight, io_timeout);
                let _ = done_tx.send(());
            })?
    };
    info!(port, "tcp peer listening");

    Ok(PeerHandle {
        port,
        state,
        stop,
        inflight,
        done,
        thread: Some(thread),
    })
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<PeerState>,
    stop: Arc<AtomicBool>,
    inflight: Arc<Inflight>,
    io_timeout: Duration,
) {
    let mut conn_id = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "peer accept failed");
                thread::sleep(ACCEPT_POLL);
                continue;
            }
        };
        conn_id += 1;
        debug!(conn_id, %addr, "peer accepted connection");

        let handler = handler.clone();
        let state = state.clone();
        let guard = inflight.clone();
        guard.enter();
        let spawned = thread::Builder::new()
            .name(format!("peer-conn-{conn_id}"))
            .spawn(move || {
                let result = prepare(&stream, io_timeout)
                    .and_then(|()| handler.handle(stream, &state));
                if let Err(e) = result {
                    warn!(conn_id, error = %e, "peer handler failed");
                    state.record_error(format!("Error: {e}"));
                }
                guard.leave();
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn peer handler");
            inflight.leave();
        }
    }
}

fn prepare(stream: &TcpStream, io_timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    stream.set_nodelay(true)
}

/// Start the peer matching a client-side scenario.
///
/// Server-only modes (error handling, reliability, performance) have no
/// dedicated peer and get the scripted one for their protocol.
pub fn start_for(scenario: &Scenario, port: u16) -> io::Result<PeerHandle> {
    let case = &scenario.case;
    let io_timeout = case.deadline();
    info!(mode = scenario.mode.name(), port, "starting scripted peer");
    match &scenario.mode {
        TestMode::Chatroom { .. } => start_tcp(
            port,
            Arc::new(ChatroomPeer::new(case.client_count(), case.deadline())),
            io_timeout,
        ),
        TestMode::StopAndWait { packets, acks } => start_tcp(
            port,
            Arc::new(StopAndWaitPeer::new(packets.clone(), acks.clone())),
            io_timeout,
        ),
        TestMode::MultiStep => start_tcp(
            port,
            Arc::new(MultiStepPeer::new(case.peer_steps())),
            io_timeout,
        ),
        TestMode::Udp => udp::start(port, case.server_script()),
        _ if case.protocol == Protocol::Udp => udp::start(port, case.server_script()),
        _ => start_tcp(
            port,
            Arc::new(ScriptedPeer::new(case.server_script(), case.interactive)),
            io_timeout,
        ),
    }
}
