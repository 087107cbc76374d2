//! `StateTable` and the per-peer `Cell` (spec §4.1/§4.2).
//!
//! The table is guarded by a single coarse mutex `M`; each `Cell` is
//! independently atomic (its own mutex plus a condition variable signalled
//! on every write) so most reads/writes never contend on `M` — the
//! notify-on-write pattern spec §9 prescribes for languages without
//! transactional memory, grounded in the `Arc<Mutex<_>>` interior-mutability
//! idiom the teacher already uses for shared, mutable state
//! (`common/time.rs::RefClock`).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::addr::PeerAddr;
use crate::state::ConnectionState;

/// One peer's atomic state cell. Never reused after its entry is removed
/// from the table — a fresh connection for the same peer always gets a
/// fresh `Cell` (spec §4.2).
pub(crate) struct Cell<A, H> {
    state: Mutex<ConnectionState<A, H>>,
    changed: Condvar,
}

impl<A, H> Cell<A, H> {
    pub fn new(state: ConnectionState<A, H>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnectionState<A, H>> {
        self.state.lock().unwrap()
    }

    /// Replace the held state and wake every waiter — the "notify on every
    /// write" half of the pattern.
    pub fn set(&self, guard: &mut MutexGuard<'_, ConnectionState<A, H>>, new: ConnectionState<A, H>) {
        **guard = new;
        self.changed.notify_all();
    }

    /// Block until the next write to this cell, releasing the lock while
    /// asleep.
    pub fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, ConnectionState<A, H>>,
    ) -> MutexGuard<'a, ConnectionState<A, H>> {
        self.changed.wait(guard).unwrap()
    }
}

/// `peerAddr -> PerPeerState` map guarded by `M`.
pub(crate) struct StateTable<A, H> {
    map: Arc<Mutex<HashMap<A, Arc<Cell<A, H>>>>>,
}

impl<A, H> Clone for StateTable<A, H> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<A: PeerAddr, H> StateTable<A, H> {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire `M`. Callers decide, under this lock, whether to look up,
    /// insert, or remove — `with_entry`-style, per spec §4.1.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<A, Arc<Cell<A, H>>>> {
        self.map.lock().unwrap()
    }

    /// Cheap read of the current map (spec §4.1 `snapshot`). Entries
    /// themselves are still independently atomic.
    pub fn snapshot(&self) -> Vec<(A, Arc<Cell<A, H>>)> {
        self.map
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, cell)| (addr.clone(), cell.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
