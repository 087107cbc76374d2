//! A concurrent registry owning the lifecycle of peer-to-peer transport
//! connections.
//!
//! A [`ConnectionManager`] tracks, for every peer address, exactly one
//! [`state::ConnectionState`] out of nine cases, mutated only through the
//! sixteen named transitions reachable from its eight public operations.
//! Every tracked connection owns exactly one OS thread (spec §5); the
//! manager itself never blocks on application I/O, only on the admission
//! and handshake bookkeeping needed to hand a freshly negotiated connection
//! back to its caller.
//!
//! ```no_run
//! use connmgr::config::Config;
//! use connmgr::manager::with_connection_manager;
//! use connmgr::prune::RandomPrunePolicy;
//! use connmgr::socket::TcpSocketOps;
//!
//! # fn handler_for_example() -> impl connmgr::handler::Handler<std::net::SocketAddr, std::net::TcpStream> {
//! #   struct NoopHandler;
//! #   impl connmgr::handler::Handler<std::net::SocketAddr, std::net::TcpStream> for NoopHandler {
//! #       type Handle = ();
//! #       type Version = u8;
//! #       fn run(&self, _: &connmgr::addr::ConnectionId<std::net::SocketAddr>, _: connmgr::state::Provenance, _: &std::net::TcpStream, promise: connmgr::handler::PromiseTx<(), u8>) {
//! #           promise.fulfill(Ok(((), 0)));
//! #       }
//! #   }
//! #   NoopHandler
//! # }
//! let config = Config {
//!     ipv4_address: None,
//!     ipv6_address: None,
//!     socket_ops: TcpSocketOps,
//!     handler: handler_for_example(),
//!     prune_policy: RandomPrunePolicy::new(),
//!     data_flow_from_version: |_version: u8| connmgr::state::DataFlow::Duplex,
//!     time_wait_timeout: connmgr::config::DEFAULT_TIME_WAIT_TIMEOUT,
//!     protocol_idle_timeout: connmgr::config::DEFAULT_PROTOCOL_IDLE_TIMEOUT,
//!     accepted_connections_hard_limit: 64,
//! };
//!
//! with_connection_manager(config, |cm| {
//!     assert_eq!(cm.number_of_connections(), 0);
//! });
//! ```

pub mod addr;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod prune;
pub mod socket;
pub mod state;
pub(crate) mod table;
pub(crate) mod thread;
pub mod trace;

pub use addr::{AddressFamily, ConnectionId, PeerAddr};
pub use config::Config;
pub use error::{ConnectOutcome, Error, HandleError, PromoteDemoteReply, UnregisterInboundReply, UnsupportedStateReason};
pub use handler::{Handler, PromiseRx, PromiseTx};
pub use manager::{with_connection_manager, ConnectionManager};
pub use prune::{PrunePolicy, RandomPrunePolicy};
pub use socket::{SocketOps, TcpSocketOps};
pub use state::{ConnectionType, DataFlow, Provenance, StateTag, TimeoutExpired};
