//! The connection thread supervisor (spec §4.3/§5): exactly one OS thread
//! per connection, running the handler unmasked and then an unconditional
//! Cleanup step.
//!
//! Rust's `std::thread` has no asynchronous cancellation primitive (spec
//! §C.1): cancellation here is an atomic flag plus shutting down the
//! socket, which unblocks any blocking read/write inside the handler with
//! an I/O error. Cleanup is ordinary sequential code that runs after the
//! handler call returns, cancelled or not — there is nothing further to
//! "mask", since nothing in safe Rust can interrupt it mid-step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::addr::{ConnectionId, PeerAddr};
use crate::handler::{Handler, PromiseTx};
use crate::socket::SocketOps;
use crate::state::{ConnectionState, Provenance};
use crate::table::{Cell, StateTable};
use crate::trace;

/// A shutdown flag connection threads can sleep against instead of a plain
/// `thread::sleep`, so that tearing down the manager wakes every thread
/// sitting in the TIME_WAIT delay immediately (spec §C.3, testable property
/// 4 — bounded shutdown).
pub(crate) struct ShutdownSignal {
    triggered: Mutex<bool>,
    changed: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            triggered: Mutex::new(false),
            changed: Condvar::new(),
        })
    }

    pub fn trigger(&self) {
        *self.triggered.lock().unwrap() = true;
        self.changed.notify_all();
    }

    /// Sleep for `timeout`, waking early if `trigger` is called.
    pub fn sleep(&self, timeout: Duration) {
        let guard = self.triggered.lock().unwrap();
        let _ = self
            .changed
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap();
    }
}

/// The sole owner of one connection's OS thread (spec §4.3: "the thread
/// handle stored in the state is the sole owner of the thread; cancellation
/// is always via this handle").
pub(crate) struct ConnectionThreadHandle {
    cancelled: Arc<AtomicBool>,
    signal_shutdown: Arc<dyn Fn() + Send + Sync>,
}

impl ConnectionThreadHandle {
    /// Request cancellation. Idempotent: a second call is a no-op.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.signal_shutdown)();
        }
    }
}

/// Spawn the connection thread for `addr`: run `handler` on `socket`, then
/// execute Cleanup.
///
/// The thread blocks on `gate` before doing anything observable. `gate`
/// carries the `Arc<Cell>` the caller published into the table for this
/// connection (the cell's `ConnectionState::Unnegotiated` variant is the one
/// holding the `ConnectionThreadHandle` this function returns), so Cleanup
/// always operates on the exact cell this thread owns rather than
/// re-deriving it from the table by address — a concurrent caller may have
/// long since overwritten `addr` with an unrelated connection's cell (spec
/// §5 race variant ii). If the caller abandons the dial before ever
/// publishing a cell (the `gate` sender is dropped instead), the thread
/// closes its own socket and returns without running the handler or
/// Cleanup at all — there is nothing in the table that belongs to it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn<A, S, Han>(
    table: StateTable<A, Han::Handle>,
    addr: A,
    conn_id: ConnectionId<A>,
    provenance: Provenance,
    socket: S::Socket,
    socket_ops: Arc<S>,
    handler: Arc<Han>,
    time_wait_timeout: Duration,
    shutdown: Arc<ShutdownSignal>,
    promise_tx: PromiseTx<Han::Handle, Han::Version>,
    gate: Receiver<Arc<Cell<A, Han::Handle>>>,
) -> ConnectionThreadHandle
where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
    Han: Handler<A, S::Socket>,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let socket = Arc::new(socket);

    let signal_shutdown: Arc<dyn Fn() + Send + Sync> = {
        let socket = socket.clone();
        let socket_ops = socket_ops.clone();
        Arc::new(move || {
            if let Err(err) = socket_ops.shutdown(&socket) {
                tracing::trace!(
                    target: trace::TARGET,
                    "shutdown of cancelled socket failed (likely already closed): {err}"
                );
            }
        })
    };

    {
        let socket = socket.clone();
        let socket_ops = socket_ops.clone();
        let handler = handler.clone();
        let table = table.clone();
        let name = format!("connmgr-{}", conn_id.remote);
        thread::Builder::new()
            .name(name)
            .spawn(move || match gate.recv() {
                Ok(own_cell) => {
                    handler.run(&conn_id, provenance, &socket, promise_tx);
                    run_cleanup(
                        &table,
                        &addr,
                        &own_cell,
                        socket_ops.as_ref(),
                        &socket,
                        time_wait_timeout,
                        &shutdown,
                    );
                }
                Err(_) => {
                    let _ = socket_ops.close(&socket);
                }
            })
            .expect("failed to spawn connection thread");
    }

    ConnectionThreadHandle {
        cancelled,
        signal_shutdown,
    }
}

enum CleanupAction {
    Delete,
    TimeWait,
}

/// Remove the table's entry for `addr` if, and only if, it is still
/// `own_cell` — a concurrent caller may have already replaced it with an
/// unrelated connection's cell (spec §5 race variant ii), and an
/// address-keyed removal would delete that connection's live entry instead
/// of this (stale) one.
fn remove_if_still_ours<A, Handle>(table: &StateTable<A, Handle>, addr: &A, own_cell: &Arc<Cell<A, Handle>>)
where
    A: PeerAddr,
{
    let mut map = table.lock();
    if matches!(map.get(addr), Some(cell) if Arc::ptr_eq(cell, own_cell)) {
        map.remove(addr);
    }
}

/// Spec §4.3's Cleanup step, run unconditionally once the handler body
/// returns (normally, on error, or because it was cancelled).
///
/// Operates on `own_cell` directly rather than re-fetching `addr` from the
/// table: by the time this runs, `addr` may already hold a different
/// connection's cell (spec §5 race variant ii), and Cleanup must never
/// touch a cell it wasn't actually responsible for.
fn run_cleanup<A, S, Handle>(
    table: &StateTable<A, Handle>,
    addr: &A,
    own_cell: &Arc<Cell<A, Handle>>,
    socket_ops: &S,
    socket: &S::Socket,
    time_wait_timeout: Duration,
    shutdown: &ShutdownSignal,
) where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
{
    let action = {
        let mut st = own_cell.lock();
        match &*st {
            ConnectionState::InboundIdle { .. } => {
                own_cell.set(&mut st, ConnectionState::Terminated { error: None });
                CleanupAction::TimeWait
            }
            ConnectionState::Terminating { .. } => CleanupAction::TimeWait,
            // Already `Terminated` means either this connection's own
            // caller beat us to recording the outcome (a hard
            // handshake failure) or a concurrent `shutdown()` marked
            // it — either way it is this connection's entry and
            // nothing else will remove it, so we do.
            ConnectionState::Terminated { .. } => {
                drop(st);
                remove_if_still_ours(table, addr, own_cell);
                CleanupAction::Delete
            }
            _ => {
                own_cell.set(&mut st, ConnectionState::Terminated { error: None });
                drop(st);
                remove_if_still_ours(table, addr, own_cell);
                CleanupAction::Delete
            }
        }
    };

    let _ = socket_ops.close(socket);

    match action {
        CleanupAction::Delete => {
            trace::emit(&trace::Event::EntryRemoved { peer: addr.clone() });
        }
        CleanupAction::TimeWait => {
            shutdown.sleep(time_wait_timeout);
            let mut st = own_cell.lock();
            if matches!(
                &*st,
                ConnectionState::Terminating { .. } | ConnectionState::Terminated { .. }
            ) {
                own_cell.set(&mut st, ConnectionState::Terminated { error: None });
                drop(st);
                remove_if_still_ours(table, addr, own_cell);
                trace::emit(&trace::Event::EntryRemoved { peer: addr.clone() });
            }
        }
    }
}
