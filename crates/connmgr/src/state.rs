//! The nine-case per-peer state machine (spec §3).
//!
//! A tagged variant, not a struct of optional fields: the invariant that
//! `handle` exists iff the tag permits falls out of the type rather than
//! needing to be checked at runtime.

use std::fmt;

use crate::addr::ConnectionId;
use crate::error::HandleError;
use crate::thread::ConnectionThreadHandle;

/// Whether a connection was accepted or dialed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    Inbound,
    Outbound,
}

/// Negotiated data-flow direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataFlow {
    Unidirectional,
    Duplex,
}

/// Whether the reuse window on a demoted outbound-duplex connection has
/// elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutExpired {
    Ticking,
    Expired,
}

/// The state of one peer's connection, as tracked by a `Cell`.
///
/// `H` is the application-level handle returned by the `Handler`; the CM
/// never looks inside it.
pub enum ConnectionState<A, H> {
    /// Outbound dial reserved; socket not yet connected.
    ReservedOutbound,
    /// Socket exists, handshake running.
    Unnegotiated {
        provenance: Provenance,
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
    },
    /// Negotiated outbound, Unidirectional.
    OutboundUni {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        handle: H,
    },
    /// Outbound-only use of a Duplex connection.
    OutboundDup {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        handle: H,
        timer: TimeoutExpired,
    },
    /// Negotiated, remote currently silent.
    InboundIdle {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        handle: H,
        data_flow: DataFlow,
    },
    /// Actively used by the remote.
    Inbound {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        handle: H,
        data_flow: DataFlow,
    },
    /// In use in both directions.
    Duplex {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        handle: H,
    },
    /// Closing; socket may still be in TIME_WAIT.
    Terminating {
        conn_id: ConnectionId<A>,
        thread: ConnectionThreadHandle,
        error: Option<HandleError>,
    },
    /// Fully dead; entry awaits removal.
    Terminated { error: Option<HandleError> },
}

/// Discriminant-only view of `ConnectionState`, comparable and printable,
/// used by transition tests and tracing where the payload (thread handles,
/// opaque `H`) would get in the way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateTag {
    ReservedOutbound,
    Unnegotiated(Provenance),
    OutboundUni,
    OutboundDup(TimeoutExpired),
    InboundIdle(DataFlow),
    Inbound(DataFlow),
    Duplex,
    Terminating,
    Terminated,
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTag::ReservedOutbound => write!(f, "ReservedOutbound"),
            StateTag::Unnegotiated(p) => write!(f, "Unnegotiated({p:?})"),
            StateTag::OutboundUni => write!(f, "OutboundUni"),
            StateTag::OutboundDup(t) => write!(f, "OutboundDup({t:?})"),
            StateTag::InboundIdle(df) => write!(f, "InboundIdle({df:?})"),
            StateTag::Inbound(df) => write!(f, "Inbound({df:?})"),
            StateTag::Duplex => write!(f, "Duplex"),
            StateTag::Terminating => write!(f, "Terminating"),
            StateTag::Terminated => write!(f, "Terminated"),
        }
    }
}

/// What a `PrunePolicy` is shown about a connection (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    UnnegotiatedConn(Provenance),
    NegotiatedConn(Provenance, DataFlow),
    InboundIdleConn(DataFlow),
    DuplexConn,
}

impl<A, H> ConnectionState<A, H> {
    pub fn tag(&self) -> StateTag {
        match self {
            ConnectionState::ReservedOutbound => StateTag::ReservedOutbound,
            ConnectionState::Unnegotiated { provenance, .. } => StateTag::Unnegotiated(*provenance),
            ConnectionState::OutboundUni { .. } => StateTag::OutboundUni,
            ConnectionState::OutboundDup { timer, .. } => StateTag::OutboundDup(*timer),
            ConnectionState::InboundIdle { data_flow, .. } => StateTag::InboundIdle(*data_flow),
            ConnectionState::Inbound { data_flow, .. } => StateTag::Inbound(*data_flow),
            ConnectionState::Duplex { .. } => StateTag::Duplex,
            ConnectionState::Terminating { .. } => StateTag::Terminating,
            ConnectionState::Terminated { .. } => StateTag::Terminated,
        }
    }

    /// The connection thread owning this state, if any (invariant 2: every
    /// state but `ReservedOutbound`/`Terminated` owns exactly one).
    pub fn thread(&self) -> Option<&ConnectionThreadHandle> {
        match self {
            ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
            ConnectionState::Unnegotiated { thread, .. }
            | ConnectionState::OutboundUni { thread, .. }
            | ConnectionState::OutboundDup { thread, .. }
            | ConnectionState::InboundIdle { thread, .. }
            | ConnectionState::Inbound { thread, .. }
            | ConnectionState::Duplex { thread, .. }
            | ConnectionState::Terminating { thread, .. } => Some(thread),
        }
    }

    pub fn conn_id(&self) -> Option<&ConnectionId<A>> {
        match self {
            ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
            ConnectionState::Unnegotiated { conn_id, .. }
            | ConnectionState::OutboundUni { conn_id, .. }
            | ConnectionState::OutboundDup { conn_id, .. }
            | ConnectionState::InboundIdle { conn_id, .. }
            | ConnectionState::Inbound { conn_id, .. }
            | ConnectionState::Duplex { conn_id, .. }
            | ConnectionState::Terminating { conn_id, .. } => Some(conn_id),
        }
    }

    /// The `ConnectionType` a `PrunePolicy` would see, for states that have
    /// one (invariant 5: `handle` present iff negotiated).
    pub fn connection_type(&self) -> Option<ConnectionType> {
        match self {
            ConnectionState::Unnegotiated { provenance, .. } => {
                Some(ConnectionType::UnnegotiatedConn(*provenance))
            }
            ConnectionState::OutboundUni { .. } => Some(ConnectionType::NegotiatedConn(
                Provenance::Outbound,
                DataFlow::Unidirectional,
            )),
            ConnectionState::OutboundDup { .. } => Some(ConnectionType::NegotiatedConn(
                Provenance::Outbound,
                DataFlow::Duplex,
            )),
            ConnectionState::InboundIdle { data_flow, .. } => {
                Some(ConnectionType::InboundIdleConn(*data_flow))
            }
            ConnectionState::Inbound { data_flow, .. } => Some(ConnectionType::NegotiatedConn(
                Provenance::Inbound,
                *data_flow,
            )),
            ConnectionState::Duplex { .. } => Some(ConnectionType::DuplexConn),
            ConnectionState::ReservedOutbound
            | ConnectionState::Terminating { .. }
            | ConnectionState::Terminated { .. } => None,
        }
    }

    /// Whether this state counts toward `accepted_connections_hard_limit`
    /// (spec §4.9).
    pub fn counts_toward_admission_limit(&self) -> bool {
        matches!(
            self,
            ConnectionState::Unnegotiated {
                provenance: Provenance::Inbound,
                ..
            } | ConnectionState::InboundIdle { .. }
                | ConnectionState::Inbound { .. }
                | ConnectionState::OutboundDup { .. }
                | ConnectionState::Duplex { .. }
        )
    }
}
