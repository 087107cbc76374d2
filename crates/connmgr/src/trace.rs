//! Structured tracing events, mirroring the teacher's `fsm::peermgr::Event`:
//! a typed enum with a `Display` impl, emitted alongside a `tracing` line at
//! `target: "connmgr"` so a caller can subscribe to either the log stream or
//! (by instrumenting `emit`) the typed feed.

use std::fmt;

use crate::state::{DataFlow, Provenance, StateTag};

pub const TARGET: &str = "connmgr";

/// A single noteworthy thing the connection manager did, logged and
/// available for programmatic consumption.
#[derive(Clone, Debug)]
pub enum Event<A> {
    InboundIncluded { peer: A },
    OutboundRequested { peer: A },
    Reused { peer: A, data_flow: DataFlow },
    Negotiated { peer: A, provenance: Provenance, data_flow: DataFlow },
    HandshakeFailed { peer: A, reason: String },
    Demoted { peer: A, to: StateTag },
    Promoted { peer: A, to: StateTag },
    ThreadCancelled { peer: A },
    EntryRemoved { peer: A },
    PruneTriggered { admitted: usize, limit: usize, victims: usize },
    Shutdown { live_connections: usize },
    /// A transition the source marked `assert False` was taken. Not a panic
    /// — see spec §9 Open Questions — but worth a loud log line.
    InvariantViolation { peer: A, detail: &'static str },
}

impl<A: fmt::Display> fmt::Display for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::InboundIncluded { peer } => write!(f, "inbound connection included from {peer}"),
            Event::OutboundRequested { peer } => write!(f, "outbound connection requested to {peer}"),
            Event::Reused { peer, data_flow } => {
                write!(f, "reused existing connection to {peer} as {data_flow:?}")
            }
            Event::Negotiated {
                peer,
                provenance,
                data_flow,
            } => write!(f, "{peer} negotiated ({provenance:?}, {data_flow:?})"),
            Event::HandshakeFailed { peer, reason } => {
                write!(f, "handshake with {peer} failed: {reason}")
            }
            Event::Demoted { peer, to } => write!(f, "{peer} demoted to {to}"),
            Event::Promoted { peer, to } => write!(f, "{peer} promoted to {to}"),
            Event::ThreadCancelled { peer } => write!(f, "connection thread for {peer} cancelled"),
            Event::EntryRemoved { peer } => write!(f, "table entry for {peer} removed"),
            Event::PruneTriggered {
                admitted,
                limit,
                victims,
            } => write!(
                f,
                "admission count {admitted} exceeds limit {limit}, pruning {victims} peer(s)"
            ),
            Event::Shutdown { live_connections } => {
                write!(f, "shutdown: tearing down {live_connections} live connection(s)")
            }
            Event::InvariantViolation { peer, detail } => {
                write!(f, "invariant violation for {peer}: {detail}")
            }
        }
    }
}

/// Log `event` at the appropriate level and target. Kept as a free function
/// (rather than a method on a trace-sink trait/object) since every caller in
/// this crate already runs inside a `tracing` subscriber scope — the same
/// choice the teacher makes in `fsm/peermgr.rs`.
pub fn emit<A: fmt::Display>(event: &Event<A>) {
    match event {
        Event::InvariantViolation { .. } => tracing::error!(target: TARGET, "{event}"),
        Event::HandshakeFailed { .. } | Event::PruneTriggered { .. } => {
            tracing::warn!(target: TARGET, "{event}")
        }
        _ => tracing::debug!(target: TARGET, "{event}"),
    }
}
