//! Error taxonomy (spec §7) and the reply types the eight public operations
//! return.
//!
//! Ordinary lifecycle conditions (missing peer, redundant demote, ...) are
//! not errors — they come back as an `UnsupportedState`/no-op reply value.
//! Only genuine misuse (`ForbiddenConnection`, `ForbiddenOperation`,
//! `ConnectionExists`) and invariant violations (`ImpossibleState`) are
//! `Err`.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::addr::ConnectionId;
use crate::state::{DataFlow, Provenance, StateTag};

/// Reported by the `Handler` through the handshake promise.
#[derive(Clone, Debug, Error)]
pub enum HandleError {
    /// Soft failure: the peer may legitimately be retried once TIME_WAIT
    /// elapses.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),
    /// Hard failure: a protocol violation, skip TIME_WAIT.
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocolViolation(String),
}

impl HandleError {
    /// Whether this failure should still go through the TIME_WAIT path, or
    /// can be forgotten immediately.
    pub fn is_soft(&self) -> bool {
        matches!(self, HandleError::HandshakeFailure(_))
    }
}

/// Why an operation refused to do anything, for conditions that are
/// ordinary (not bugs) and reported rather than raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsupportedStateReason {
    UnknownConnection,
    Current(StateTag),
}

impl fmt::Display for UnsupportedStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedStateReason::UnknownConnection => write!(f, "unknown connection"),
            UnsupportedStateReason::Current(tag) => write!(f, "unsupported in state {tag}"),
        }
    }
}

/// The CM-wide error taxonomy of spec §7.
#[derive(Debug, Error)]
pub enum Error<A: fmt::Debug + fmt::Display> {
    #[error("connection to {peer} already exists ({provenance:?})")]
    ConnectionExists { peer: A, provenance: Provenance },

    #[error("negotiated data flow forbids this connection direction: {conn_id}")]
    ForbiddenConnection { conn_id: ConnectionId<A> },

    #[error("operation not legal for {peer} in state {in_state}")]
    ForbiddenOperation { peer: A, in_state: StateTag },

    #[error("invariant violation for {peer}: {detail}")]
    ImpossibleState { peer: A, detail: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of `includeInbound` / `requestOutbound`.
#[derive(Debug)]
pub enum ConnectOutcome<A, H> {
    Connected {
        conn_id: ConnectionId<A>,
        data_flow: DataFlow,
        handle: H,
    },
    Disconnected {
        /// Absent only for the rare race where the peer's entry was torn
        /// down by something else (e.g. a concurrent shutdown) before this
        /// call could observe a connection identifier for it.
        conn_id: Option<ConnectionId<A>>,
        error: Option<HandleError>,
    },
}

/// Reply of `unregisterInbound` (spec §4.6). Never an `Err` — every branch,
/// including the defensive ones, yields a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnregisterInboundReply {
    /// Transitioned but the connection thread keeps running.
    KeepTr,
    /// Transitioned to `Terminating` and the thread was cancelled.
    CommitTr,
    Unsupported(UnsupportedStateReason),
}

/// Reply of `promotedToWarmRemote` / `demotedToColdRemote` (spec §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromoteDemoteReply {
    Ok,
    Unsupported(UnsupportedStateReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_error_soft_classification() {
        assert!(HandleError::HandshakeFailure("timeout".into()).is_soft());
        assert!(!HandleError::HandshakeProtocolViolation("bad magic".into()).is_soft());
    }
}
