//! Shared integration-test harness: a scriptable `Handler` plus real
//! loopback TCP plumbing, so the transition tests exercise the same
//! `TcpSocketOps` binding the crate ships rather than a mock transport.

use std::collections::HashMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once};
use std::time::Duration;

use connmgr::handler::{HandshakeResult, PromiseTx};
use connmgr::{Config, ConnectionId, DataFlow, Handler, Provenance, RandomPrunePolicy, SocketOps, TcpSocketOps};

static TRACING_INIT: Once = Once::new();

/// Route `tracing::{debug,warn,error}!` from the crate under test (spec §9
/// trace events) to stderr, gated by `RUST_LOG` — same purpose as the
/// teacher's own `tracing-subscriber::fmt::init()` in its binaries, just
/// scoped to test runs instead. Every test calls this first; `Once` keeps
/// repeated calls across the test binary's many `#[test]` fns cheap.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A `Handler` whose handshake outcome per peer is scripted ahead of time,
/// with an optional gate to hold the handshake open long enough for a test
/// to observe the `Unnegotiated` state.
pub struct ScriptedHandler {
    next_handle: AtomicU64,
    scripted: Mutex<HashMap<SocketAddr, HandshakeResult<u64, u8>>>,
    default_version: u8,
    release_gate: Option<Arc<Barrier>>,
    stay_alive: bool,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            scripted: Mutex::new(HashMap::new()),
            default_version: 1,
            release_gate: None,
            stay_alive: true,
        }
    }

    /// Negotiate `version` for `peer`, rather than the default.
    pub fn script_version(&self, peer: SocketAddr, version: u8) {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.scripted.lock().unwrap().insert(peer, Ok((handle, version)));
    }

    /// Fail the handshake with `peer`.
    pub fn script_failure(&self, peer: SocketAddr, err: connmgr::HandleError) {
        self.scripted.lock().unwrap().insert(peer, Err(err));
    }

    /// Hold every handshake at the barrier until the test releases it.
    pub fn with_gate(mut self, gate: Arc<Barrier>) -> Self {
        self.release_gate = Some(gate);
        self
    }

    /// Return from `run` as soon as the promise is fulfilled, instead of
    /// looping on reads — used by tests that only care about negotiation.
    pub fn without_keepalive(mut self) -> Self {
        self.stay_alive = false;
        self
    }

    fn outcome_for(&self, peer: SocketAddr) -> HandshakeResult<u64, u8> {
        match self.scripted.lock().unwrap().remove(&peer) {
            Some(outcome) => outcome,
            None => Ok((self.next_handle.fetch_add(1, Ordering::SeqCst), self.default_version)),
        }
    }
}

impl Handler<SocketAddr, TcpStream> for ScriptedHandler {
    type Handle = u64;
    type Version = u8;

    fn run(
        &self,
        conn_id: &ConnectionId<SocketAddr>,
        _provenance: Provenance,
        bearer: &TcpStream,
        promise: PromiseTx<u64, u8>,
    ) {
        if let Some(gate) = &self.release_gate {
            gate.wait();
        }
        let outcome = self.outcome_for(conn_id.remote);
        let keep_alive = self.stay_alive && outcome.is_ok();
        promise.fulfill(outcome);
        if keep_alive {
            let mut buf = [0u8; 1];
            loop {
                match bearer.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e)
                        if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
                    {
                        continue
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Connect a real loopback TCP pair, returning the client side, the
/// server-accepted side, and the address the server observed the client
/// connect from (usable directly as a peer key).
pub fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, client_addr) = listener.accept().unwrap();
    (client, server, client_addr)
}

/// A `Config` tuned for fast tests: short TIME_WAIT and idle timeouts.
pub fn test_config(
    handler: ScriptedHandler,
) -> Config<SocketAddr, TcpSocketOps, ScriptedHandler, RandomPrunePolicy, impl Fn(u8) -> DataFlow> {
    test_config_with_socket_ops(TcpSocketOps, handler)
}

/// As `test_config`, but with a caller-supplied `SocketOps` — used to slot in
/// `DelayedConnectOps` for tests that need to win a race deterministically.
pub fn test_config_with_socket_ops<S>(
    socket_ops: S,
    handler: ScriptedHandler,
) -> Config<SocketAddr, S, ScriptedHandler, RandomPrunePolicy, impl Fn(u8) -> DataFlow>
where
    S: SocketOps<Addr = SocketAddr>,
{
    Config {
        ipv4_address: None,
        ipv6_address: None,
        socket_ops,
        handler,
        prune_policy: RandomPrunePolicy::seeded(1),
        data_flow_from_version: |version: u8| {
            if version == 1 {
                DataFlow::Duplex
            } else {
                DataFlow::Unidirectional
            }
        },
        time_wait_timeout: Duration::from_millis(50),
        protocol_idle_timeout: Duration::from_millis(20),
        accepted_connections_hard_limit: 8,
    }
}

/// A `SocketOps` that sleeps for a fixed delay before actually connecting,
/// otherwise identical to `TcpSocketOps`. Lets a test hold a `requestOutbound`
/// dial inside its blocking `connect()` call long enough for a concurrent
/// `includeInbound` to win the race for the same peer address (spec §5 race
/// variant ii).
pub struct DelayedConnectOps {
    inner: TcpSocketOps,
    delay: Duration,
}

impl DelayedConnectOps {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: TcpSocketOps,
            delay,
        }
    }
}

impl SocketOps for DelayedConnectOps {
    type Addr = SocketAddr;
    type Socket = TcpStream;

    fn open_to_connect(&self, addr: &SocketAddr) -> std::io::Result<TcpStream> {
        self.inner.open_to_connect(addr)
    }

    fn bind(&self, socket: &TcpStream, local: SocketAddr) -> std::io::Result<()> {
        self.inner.bind(socket, local)
    }

    fn connect(&self, socket: &TcpStream, addr: &SocketAddr) -> std::io::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.connect(socket, addr)
    }

    fn prepare_bearer(&self, socket: &TcpStream, timeout: Duration) -> std::io::Result<()> {
        self.inner.prepare_bearer(socket, timeout)
    }

    fn shutdown(&self, socket: &TcpStream) -> std::io::Result<()> {
        self.inner.shutdown(socket)
    }

    fn close(&self, socket: &TcpStream) -> std::io::Result<()> {
        self.inner.close(socket)
    }

    fn local_addr(&self, socket: &TcpStream) -> std::io::Result<SocketAddr> {
        self.inner.local_addr(socket)
    }
}
