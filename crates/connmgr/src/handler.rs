//! The `Handler` interface (spec §6): negotiates a version on a fresh
//! socket, then runs the application-level multiplexer for as long as the
//! connection lives. The CM only ever observes the handshake's outcome,
//! delivered through a single-writer/single-reader promise cell — the same
//! `chan::bounded(1)` request/reply idiom the teacher uses for its
//! controller handle (`client/controller.rs::Handle::broadcast`).

use std::fmt;

use crossbeam_channel::{Receiver, Sender};

use crate::addr::{ConnectionId, PeerAddr};
use crate::error::HandleError;
use crate::state::Provenance;

pub type HandshakeResult<H, V> = Result<(H, V), HandleError>;

/// The write half of the handshake promise, handed to a `Handler` so its
/// body can report success or failure exactly once.
pub struct PromiseTx<H, V>(Sender<HandshakeResult<H, V>>);

/// The read half, held by whichever CM operation spawned the connection
/// thread and is waiting on its outcome.
pub struct PromiseRx<H, V>(Receiver<HandshakeResult<H, V>>);

/// A fresh, empty promise cell.
pub fn promise<H, V>() -> (PromiseTx<H, V>, PromiseRx<H, V>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (PromiseTx(tx), PromiseRx(rx))
}

impl<H, V> PromiseTx<H, V> {
    /// Fulfil the promise. Should be called exactly once, before the
    /// handler's body returns; a dropped, unfulfilled promise is observed by
    /// the reader as a disconnected channel.
    pub fn fulfill(self, result: HandshakeResult<H, V>) {
        let _ = self.0.send(result);
    }
}

impl<H, V> PromiseRx<H, V> {
    /// Block until the handler fulfils the promise or disappears without
    /// fulfilling it (treated as a protocol violation by the caller).
    pub fn wait(self) -> HandshakeResult<H, V> {
        match self.0.recv() {
            Ok(result) => result,
            Err(_) => Err(HandleError::HandshakeProtocolViolation(
                "handler thread exited without reporting an outcome".into(),
            )),
        }
    }
}

/// External collaborator that negotiates a version on a bearer and then runs
/// the post-negotiation protocol multiplexer.
///
/// `run` is expected to block for the lifetime of the connection: it
/// fulfils `promise` as soon as negotiation concludes, then keeps running
/// application-level multiplexing until the bearer is closed or shut down
/// out from under it (the CM's cancellation mechanism, spec §5).
pub trait Handler<A: PeerAddr, S>: Send + Sync + 'static {
    /// Opaque application-level handle; the CM never looks inside it.
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;
    type Version: Copy + fmt::Debug + Send + 'static;

    fn run(
        &self,
        conn_id: &ConnectionId<A>,
        provenance: Provenance,
        bearer: &S,
        promise: PromiseTx<Self::Handle, Self::Version>,
    );
}
