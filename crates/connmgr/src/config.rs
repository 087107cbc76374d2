//! In-memory configuration (spec §6). Loading this from disk, environment,
//! or CLI flags is explicitly out of scope (spec §1 Non-goals); this is the
//! boundary a caller constructs and passes in, the same shape as the
//! teacher's `client::controller::P2PConfig` and `fsm::handler::Config`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::addr::PeerAddr;
use crate::handler::Handler;
use crate::prune::PrunePolicy;
use crate::socket::SocketOps;

/// Default TIME_WAIT hold, spec §5.
pub const DEFAULT_TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Documented for the inbound governor; the CM itself does not enforce it
/// (spec §5).
pub const DEFAULT_PROTOCOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Translates a handler's negotiated protocol version into a `DataFlow`.
/// A plain closure trait rather than a method on `Handler` since the spec
/// lists it as an independent configuration option (spec §6
/// `dataFlowFromVersion`), pluggable without touching the handler.
pub trait DataFlowFromVersion<V>: Send + Sync + 'static {
    fn data_flow(&self, version: V) -> crate::state::DataFlow;
}

impl<V, F> DataFlowFromVersion<V> for F
where
    F: Fn(V) -> crate::state::DataFlow + Send + Sync + 'static,
{
    fn data_flow(&self, version: V) -> crate::state::DataFlow {
        self(version)
    }
}

/// Everything a `ConnectionManager` needs to run.
pub struct Config<A, S, H, P, D>
where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
    H: Handler<A, S::Socket>,
    P: PrunePolicy<A>,
    D: DataFlowFromVersion<H::Version>,
{
    /// Local bind address used for outbound dials when the target is IPv4.
    pub ipv4_address: Option<SocketAddr>,
    /// Local bind address used for outbound dials when the target is IPv6.
    pub ipv6_address: Option<SocketAddr>,
    pub socket_ops: S,
    pub handler: H,
    pub prune_policy: P,
    pub data_flow_from_version: D,
    pub time_wait_timeout: Duration,
    pub protocol_idle_timeout: Duration,
    pub accepted_connections_hard_limit: usize,
}

impl<A, S, H, P, D> Default for Config<A, S, H, P, D>
where
    A: PeerAddr,
    S: SocketOps<Addr = A> + Default,
    H: Handler<A, S::Socket> + Default,
    P: PrunePolicy<A> + Default,
    D: DataFlowFromVersion<H::Version> + Default,
{
    fn default() -> Self {
        Self {
            ipv4_address: None,
            ipv6_address: None,
            socket_ops: S::default(),
            handler: H::default(),
            prune_policy: P::default(),
            data_flow_from_version: D::default(),
            time_wait_timeout: DEFAULT_TIME_WAIT_TIMEOUT,
            protocol_idle_timeout: DEFAULT_PROTOCOL_IDLE_TIMEOUT,
            accepted_connections_hard_limit: 64,
        }
    }
}
