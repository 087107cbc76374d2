//! `ConnectionManager`: the eight public operations of spec §4.4–§4.8, plus
//! admission counting, the prune path, and scoped shutdown.
//!
//! Grounded in the teacher's `client::controller::P2PClient` for the
//! "build from a `Config`, run, tear down on every exit path" shape; the
//! state-machine bodies themselves are this specification's own, since the
//! teacher's protocol state machines (`fsm::peermgr`) solve a materially
//! different problem (Bitcoin handshake/address-book maintenance, not a
//! generic Duplex-reuse connection registry).

use std::collections::HashMap;
use std::sync::Arc;

use crate::addr::{ConnectionId, PeerAddr};
use crate::config::{Config, DataFlowFromVersion};
use crate::error::{
    ConnectOutcome, Error, PromoteDemoteReply, UnregisterInboundReply, UnsupportedStateReason,
};
use crate::handler::{self, Handler};
use crate::prune::PrunePolicy;
use crate::socket::SocketOps;
use crate::state::{ConnectionState, DataFlow, Provenance, StateTag, TimeoutExpired};
use crate::table::{Cell, StateTable};
use crate::thread::{self, ShutdownSignal};
use crate::trace;

/// Move `st`'s current value out, leaving a `Terminated(None)` placeholder
/// behind. The placeholder is always overwritten by `cell.set` before the
/// cell's lock is released — used whenever a transition needs to consume a
/// variant's payload (`thread`, `handle`) by value rather than by
/// reference.
fn take<A, H>(st: &mut ConnectionState<A, H>) -> ConnectionState<A, H> {
    std::mem::replace(st, ConnectionState::Terminated { error: None })
}

/// The concurrent registry owning every peer connection's lifecycle.
pub struct ConnectionManager<A, S, Han, P, D>
where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
    Han: Handler<A, S::Socket>,
    P: PrunePolicy<A>,
    D: DataFlowFromVersion<Han::Version>,
{
    table: StateTable<A, Han::Handle>,
    socket_ops: Arc<S>,
    handler: Arc<Han>,
    prune_policy: Arc<P>,
    data_flow_from_version: Arc<D>,
    ipv4_address: Option<std::net::SocketAddr>,
    ipv6_address: Option<std::net::SocketAddr>,
    time_wait_timeout: std::time::Duration,
    protocol_idle_timeout: std::time::Duration,
    accepted_connections_hard_limit: usize,
    shutdown_signal: Arc<ShutdownSignal>,
}

impl<A, S, Han, P, D> ConnectionManager<A, S, Han, P, D>
where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
    Han: Handler<A, S::Socket>,
    P: PrunePolicy<A>,
    D: DataFlowFromVersion<Han::Version>,
{
    pub fn new(config: Config<A, S, Han, P, D>) -> Self {
        Self {
            table: StateTable::new(),
            socket_ops: Arc::new(config.socket_ops),
            handler: Arc::new(config.handler),
            prune_policy: Arc::new(config.prune_policy),
            data_flow_from_version: Arc::new(config.data_flow_from_version),
            ipv4_address: config.ipv4_address,
            ipv6_address: config.ipv6_address,
            time_wait_timeout: config.time_wait_timeout,
            protocol_idle_timeout: config.protocol_idle_timeout,
            accepted_connections_hard_limit: config.accepted_connections_hard_limit,
            shutdown_signal: ShutdownSignal::new(),
        }
    }

    /// Total number of peer entries currently tracked, regardless of
    /// whether they count toward the admission limit (spec §6).
    pub fn number_of_connections(&self) -> usize {
        self.table.len()
    }

    fn local_bind_addr(&self, peer: &A) -> Option<std::net::SocketAddr> {
        use crate::addr::AddressFamily;
        match peer.address_family() {
            AddressFamily::V4 => self.ipv4_address,
            AddressFamily::V6 => self.ipv6_address,
            AddressFamily::Other => None,
        }
    }

    // ---- §4.4 includeInbound -------------------------------------------

    pub fn include_inbound(
        &self,
        socket: S::Socket,
        peer: A,
    ) -> Result<ConnectOutcome<A, Han::Handle>, Error<A>> {
        self.socket_ops
            .prepare_bearer(&socket, self.protocol_idle_timeout)
            .map_err(Error::Io)?;
        let local = self.socket_ops.local_addr(&socket).map_err(Error::Io)?;
        let conn_id = ConnectionId::new(peer.clone(), local);
        trace::emit(&trace::Event::InboundIncluded { peer: peer.clone() });

        let (promise_tx, promise_rx) = handler::promise();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(0);

        let thread_handle = thread::spawn(
            self.table.clone(),
            peer.clone(),
            conn_id.clone(),
            Provenance::Inbound,
            socket,
            self.socket_ops.clone(),
            self.handler.clone(),
            self.time_wait_timeout,
            self.shutdown_signal.clone(),
            promise_tx,
            gate_rx,
        );

        {
            // Overwrite discipline (spec §5): a previous cell at this
            // address, if any, must never remain referenced.
            let mut map = self.table.lock();
            let cell = Cell::new(ConnectionState::Unnegotiated {
                provenance: Provenance::Inbound,
                conn_id: conn_id.clone(),
                thread: thread_handle,
            });
            map.insert(peer.clone(), cell.clone());
            drop(map);
            let _ = gate_tx.send(cell);
        }

        match promise_rx.wait() {
            Err(err) => {
                trace::emit(&trace::Event::HandshakeFailed {
                    peer: peer.clone(),
                    reason: err.to_string(),
                });
                self.finish_with_handler_error(&peer, err.clone());
                Ok(ConnectOutcome::Disconnected {
                    conn_id: Some(conn_id),
                    error: Some(err),
                })
            }
            Ok((handle, version)) => {
                let data_flow = self.data_flow_from_version.data_flow(version);
                let mut map = self.table.lock();
                let cell = map.get(&peer).cloned();
                drop(map);
                let Some(cell) = cell else {
                    return Err(Error::ImpossibleState {
                        peer: peer.clone(),
                        detail: "includeInbound succeeded but the entry had vanished",
                    });
                };
                let mut st = cell.lock();
                match st.tag() {
                    StateTag::Unnegotiated(_) | StateTag::Terminating => {
                        let prior = take(&mut st);
                        let (conn_id, thread) = match prior {
                            ConnectionState::Unnegotiated { conn_id, thread, .. } => (conn_id, thread),
                            ConnectionState::Terminating { conn_id, thread, .. } => (conn_id, thread),
                            _ => unreachable!(),
                        };
                        let handle_out = handle.clone();
                        cell.set(
                            &mut st,
                            ConnectionState::InboundIdle {
                                conn_id: conn_id.clone(),
                                thread,
                                handle,
                                data_flow,
                            },
                        );
                        trace::emit(&trace::Event::Negotiated {
                            peer: peer.clone(),
                            provenance: Provenance::Inbound,
                            data_flow,
                        });
                        Ok(ConnectOutcome::Connected {
                            conn_id,
                            data_flow,
                            handle: handle_out,
                        })
                    }
                    StateTag::Terminated => {
                        // Concurrent shutdown raced the handshake to
                        // completion; there is no thread handle left to
                        // carry into `InboundIdle`, so the connection is
                        // reported as disconnected even though negotiation
                        // itself succeeded.
                        Ok(ConnectOutcome::Disconnected {
                            conn_id: Some(conn_id),
                            error: None,
                        })
                    }
                    _ => Err(Error::ImpossibleState {
                        peer: peer.clone(),
                        detail: "includeInbound succeeded while the entry was in an unexpected state",
                    }),
                }
            }
        }
    }

    /// Shared tail of the handler-error path for both `includeInbound` and
    /// `requestOutbound`'s dial (spec §4.4 step 3 / §4.5 Phase B): mark
    /// `Terminating` for a soft failure (carrying the thread forward so its
    /// own Cleanup can still run the TIME_WAIT path) or `Terminated` for a
    /// hard one. The connection's own thread is about to return from
    /// `Handler::run` and perform Cleanup regardless; this just leaves the
    /// right state behind for it to observe.
    fn finish_with_handler_error(&self, peer: &A, err: crate::error::HandleError) {
        let mut map = self.table.lock();
        let Some(cell) = map.get(peer).cloned() else {
            return;
        };
        drop(map);
        let mut st = cell.lock();
        let prior = take(&mut st);
        let next = match prior {
            ConnectionState::Unnegotiated { conn_id, thread, .. }
            | ConnectionState::Terminating { conn_id, thread, .. }
                if err.is_soft() =>
            {
                ConnectionState::Terminating {
                    conn_id,
                    thread,
                    error: Some(err),
                }
            }
            _ => ConnectionState::Terminated { error: Some(err) },
        };
        cell.set(&mut st, next);
    }

    // ---- §4.5 requestOutbound -------------------------------------------

    pub fn request_outbound(&self, peer: A) -> Result<ConnectOutcome<A, Han::Handle>, Error<A>> {
        trace::emit(&trace::Event::OutboundRequested { peer: peer.clone() });

        match self.phase_a(&peer)? {
            PhaseA::Dial(reserved_cell) => self.dial(peer, reserved_cell),
            PhaseA::There => self.await_there(peer),
            PhaseA::Reused {
                conn_id,
                handle,
                data_flow,
            } => {
                trace::emit(&trace::Event::Reused {
                    peer: peer.clone(),
                    data_flow,
                });
                Ok(ConnectOutcome::Connected {
                    conn_id,
                    data_flow,
                    handle,
                })
            }
        }
    }

    fn phase_a(&self, peer: &A) -> Result<PhaseA<A, Han::Handle>, Error<A>> {
        loop {
            let mut map = self.table.lock();
            match map.get(peer).cloned() {
                None => {
                    let cell = Cell::new(ConnectionState::ReservedOutbound);
                    map.insert(peer.clone(), cell.clone());
                    return Ok(PhaseA::Dial(cell));
                }
                Some(cell) => {
                    let mut st = cell.lock();
                    match st.tag() {
                        StateTag::Terminated => {
                            cell.set(&mut st, ConnectionState::ReservedOutbound);
                            drop(st);
                            return Ok(PhaseA::Dial(cell));
                        }
                        StateTag::Terminating => {
                            drop(map);
                            st = cell.wait(st);
                            drop(st);
                            continue;
                        }
                        StateTag::Unnegotiated(Provenance::Inbound) => {
                            return Ok(PhaseA::There);
                        }
                        StateTag::InboundIdle(DataFlow::Duplex) => {
                            let prior = take(&mut st);
                            if let ConnectionState::InboundIdle {
                                conn_id,
                                thread,
                                handle,
                                ..
                            } = prior
                            {
                                let handle_out = handle.clone();
                                cell.set(
                                    &mut st,
                                    ConnectionState::OutboundDup {
                                        conn_id: conn_id.clone(),
                                        thread,
                                        handle,
                                        timer: TimeoutExpired::Ticking,
                                    },
                                );
                                return Ok(PhaseA::Reused {
                                    conn_id,
                                    handle: handle_out,
                                    data_flow: DataFlow::Duplex,
                                });
                            }
                            unreachable!()
                        }
                        StateTag::Inbound(DataFlow::Duplex) => {
                            let prior = take(&mut st);
                            if let ConnectionState::Inbound {
                                conn_id,
                                thread,
                                handle,
                                ..
                            } = prior
                            {
                                let handle_out = handle.clone();
                                cell.set(
                                    &mut st,
                                    ConnectionState::Duplex {
                                        conn_id: conn_id.clone(),
                                        thread,
                                        handle,
                                    },
                                );
                                return Ok(PhaseA::Reused {
                                    conn_id,
                                    handle: handle_out,
                                    data_flow: DataFlow::Duplex,
                                });
                            }
                            unreachable!()
                        }
                        StateTag::InboundIdle(DataFlow::Unidirectional)
                        | StateTag::Inbound(DataFlow::Unidirectional) => {
                            let conn_id = st.conn_id().expect("negotiated state carries a conn_id").clone();
                            return Err(Error::ForbiddenConnection { conn_id });
                        }
                        _ => {
                            return Err(Error::ConnectionExists {
                                peer: peer.clone(),
                                provenance: Provenance::Outbound,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Phase B — Nowhere: a fresh dial (spec §4.5).
    ///
    /// `reserved_cell` is the `ReservedOutbound` cell `phase_a` just created
    /// or reused for `peer`. `connect` can block for a while, during which a
    /// concurrent `includeInbound` may legitimately replace the table's
    /// entry for `peer` with its own fresh cell (spec §5 race variant ii —
    /// the near-simultaneous-open case). Every write back to the table in
    /// this function is guarded by an `Arc::ptr_eq` check against
    /// `reserved_cell` so a lost race falls through to reusing the inbound
    /// side instead of clobbering it.
    fn dial(&self, peer: A, reserved_cell: Arc<Cell<A, Han::Handle>>) -> Result<ConnectOutcome<A, Han::Handle>, Error<A>> {
        let socket = self.socket_ops.open_to_connect(&peer).map_err(Error::Io)?;

        // `bracketOnError`-style discipline: any failure past this point
        // must close the socket and reset the cell before propagating.
        macro_rules! bail {
            ($err:expr) => {{
                let _ = self.socket_ops.close(&socket);
                self.reset_reserved(&peer, &reserved_cell);
                return Err(Error::Io($err));
            }};
        }

        if let Some(local) = self.local_bind_addr(&peer) {
            if let Err(err) = self.socket_ops.bind(&socket, local) {
                bail!(err);
            }
        }
        if let Err(err) = self.socket_ops.connect(&socket, &peer) {
            bail!(err);
        }
        let local_addr = match self.socket_ops.local_addr(&socket) {
            Ok(addr) => addr,
            Err(err) => bail!(err),
        };
        if let Err(err) = self.socket_ops.prepare_bearer(&socket, self.protocol_idle_timeout) {
            bail!(err);
        }

        let conn_id = ConnectionId::new(peer.clone(), local_addr);
        let (promise_tx, promise_rx) = handler::promise();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(0);

        let thread_handle = thread::spawn(
            self.table.clone(),
            peer.clone(),
            conn_id.clone(),
            Provenance::Outbound,
            socket,
            self.socket_ops.clone(),
            self.handler.clone(),
            self.time_wait_timeout,
            self.shutdown_signal.clone(),
            promise_tx,
            gate_rx,
        );

        {
            let map = self.table.lock();
            let still_ours = matches!(map.get(&peer), Some(cell) if Arc::ptr_eq(cell, &reserved_cell));
            if still_ours {
                drop(map);
                let mut st = reserved_cell.lock();
                reserved_cell.set(
                    &mut st,
                    ConnectionState::Unnegotiated {
                        provenance: Provenance::Outbound,
                        conn_id: conn_id.clone(),
                        thread: thread_handle,
                    },
                );
                drop(st);
                let _ = gate_tx.send(reserved_cell.clone());
            } else {
                // Lost the race: our reservation was overwritten by a
                // concurrent `includeInbound`. Cancel the thread we just
                // spawned (this also shuts down its socket) and drop the
                // gate without sending — the thread sees a disconnected
                // gate, closes its own socket, and returns without ever
                // looking at the table, so it cannot clobber the cell that
                // replaced ours.
                drop(map);
                thread_handle.cancel();
                drop(gate_tx);
                return self.await_there(peer);
            }
        }

        match promise_rx.wait() {
            Err(err) => {
                trace::emit(&trace::Event::HandshakeFailed {
                    peer: peer.clone(),
                    reason: err.to_string(),
                });
                self.finish_with_handler_error(&peer, err.clone());
                Ok(ConnectOutcome::Disconnected {
                    conn_id: Some(conn_id),
                    error: Some(err),
                })
            }
            Ok((handle, version)) => {
                let data_flow = self.data_flow_from_version.data_flow(version);
                let mut map = self.table.lock();
                let cell = map.get(&peer).cloned();
                drop(map);
                let Some(cell) = cell else {
                    return Err(Error::ImpossibleState {
                        peer: peer.clone(),
                        detail: "requestOutbound dial succeeded but the entry had vanished",
                    });
                };
                let mut st = cell.lock();
                match st.tag() {
                    StateTag::Unnegotiated(_) | StateTag::Terminating => {
                        let prior = take(&mut st);
                        let (conn_id, thread) = match prior {
                            ConnectionState::Unnegotiated { conn_id, thread, .. } => (conn_id, thread),
                            ConnectionState::Terminating { conn_id, thread, .. } => (conn_id, thread),
                            _ => unreachable!(),
                        };
                        let handle_out = handle.clone();
                        let next = match data_flow {
                            DataFlow::Unidirectional => ConnectionState::OutboundUni {
                                conn_id: conn_id.clone(),
                                thread,
                                handle,
                            },
                            DataFlow::Duplex => ConnectionState::OutboundDup {
                                conn_id: conn_id.clone(),
                                thread,
                                handle,
                                timer: TimeoutExpired::Ticking,
                            },
                        };
                        cell.set(&mut st, next);
                        trace::emit(&trace::Event::Negotiated {
                            peer: peer.clone(),
                            provenance: Provenance::Outbound,
                            data_flow,
                        });
                        Ok(ConnectOutcome::Connected {
                            conn_id,
                            data_flow,
                            handle: handle_out,
                        })
                    }
                    StateTag::Terminated => Ok(ConnectOutcome::Disconnected {
                        conn_id: Some(conn_id),
                        error: None,
                    }),
                    _ => Err(Error::ImpossibleState {
                        peer: peer.clone(),
                        detail: "requestOutbound dial succeeded while the entry was in an unexpected state",
                    }),
                }
            }
        }
    }

    /// Tear down our own `ReservedOutbound` reservation after a dial
    /// failure, but only if it is still ours (spec §5 race variant ii) — a
    /// concurrent `includeInbound` may already have replaced it, in which
    /// case there is nothing of ours left to reset.
    fn reset_reserved(&self, peer: &A, reserved_cell: &Arc<Cell<A, Han::Handle>>) {
        let mut map = self.table.lock();
        if matches!(map.get(peer), Some(cell) if Arc::ptr_eq(cell, reserved_cell)) {
            let mut st = reserved_cell.lock();
            reserved_cell.set(&mut st, ConnectionState::Terminated { error: None });
            drop(st);
            map.remove(peer);
        }
    }

    /// Phase B — There: await the inbound negotiation already in flight for
    /// this peer, then reuse it (spec §4.5).
    fn await_there(&self, peer: A) -> Result<ConnectOutcome<A, Han::Handle>, Error<A>> {
        let mut cell = {
            let map = self.table.lock();
            map.get(&peer).cloned()
        };
        loop {
            let Some(current) = cell.clone() else {
                return Err(Error::ImpossibleState {
                    peer: peer.clone(),
                    detail: "There-wait found no entry to await",
                });
            };
            let mut st = current.lock();
            match st.tag() {
                StateTag::Unnegotiated(Provenance::Inbound) => {
                    st = current.wait(st);
                    drop(st);
                    let map = self.table.lock();
                    cell = map.get(&peer).cloned();
                    continue;
                }
                StateTag::InboundIdle(DataFlow::Duplex) => {
                    let prior = take(&mut st);
                    if let ConnectionState::InboundIdle {
                        conn_id,
                        thread,
                        handle,
                        ..
                    } = prior
                    {
                        let handle_out = handle.clone();
                        current.set(
                            &mut st,
                            ConnectionState::OutboundDup {
                                conn_id: conn_id.clone(),
                                thread,
                                handle,
                                timer: TimeoutExpired::Ticking,
                            },
                        );
                        trace::emit(&trace::Event::Reused {
                            peer: peer.clone(),
                            data_flow: DataFlow::Duplex,
                        });
                        return Ok(ConnectOutcome::Connected {
                            conn_id,
                            data_flow: DataFlow::Duplex,
                            handle: handle_out,
                        });
                    }
                    unreachable!()
                }
                StateTag::Inbound(DataFlow::Duplex) => {
                    let prior = take(&mut st);
                    if let ConnectionState::Inbound {
                        conn_id,
                        thread,
                        handle,
                        ..
                    } = prior
                    {
                        let handle_out = handle.clone();
                        current.set(
                            &mut st,
                            ConnectionState::Duplex {
                                conn_id: conn_id.clone(),
                                thread,
                                handle,
                            },
                        );
                        trace::emit(&trace::Event::Reused {
                            peer: peer.clone(),
                            data_flow: DataFlow::Duplex,
                        });
                        return Ok(ConnectOutcome::Connected {
                            conn_id,
                            data_flow: DataFlow::Duplex,
                            handle: handle_out,
                        });
                    }
                    unreachable!()
                }
                StateTag::InboundIdle(DataFlow::Unidirectional)
                | StateTag::Inbound(DataFlow::Unidirectional) => {
                    let conn_id = st.conn_id().expect("negotiated state carries a conn_id").clone();
                    return Err(Error::ForbiddenConnection { conn_id });
                }
                StateTag::Terminating | StateTag::Terminated => {
                    let conn_id = st.conn_id().cloned();
                    let error = match &*st {
                        ConnectionState::Terminating { error, .. } => error.clone(),
                        ConnectionState::Terminated { error } => error.clone(),
                        _ => None,
                    };
                    return Ok(ConnectOutcome::Disconnected { conn_id, error });
                }
                _ => {
                    return Err(Error::ImpossibleState {
                        peer: peer.clone(),
                        detail: "There-wait observed an unexpected state",
                    })
                }
            }
        }
    }

    // ---- §4.6 unregisterInbound ------------------------------------------

    pub fn unregister_inbound(&self, peer: &A) -> UnregisterInboundReply {
        let map = self.table.lock();
        let Some(cell) = map.get(peer).cloned() else {
            return UnregisterInboundReply::Unsupported(UnsupportedStateReason::UnknownConnection);
        };
        drop(map);
        let mut st = cell.lock();
        match st.tag() {
            StateTag::OutboundDup(TimeoutExpired::Ticking) => {
                let prior = take(&mut st);
                if let ConnectionState::OutboundDup {
                    conn_id,
                    thread,
                    handle,
                    ..
                } = prior
                {
                    cell.set(
                        &mut st,
                        ConnectionState::OutboundDup {
                            conn_id,
                            thread,
                            handle,
                            timer: TimeoutExpired::Expired,
                        },
                    );
                }
                UnregisterInboundReply::KeepTr
            }
            StateTag::OutboundDup(TimeoutExpired::Expired) => {
                trace::emit(&trace::Event::InvariantViolation {
                    peer: peer.clone(),
                    detail: "unregisterInbound observed OutboundDup(Expired) (no-op, spec §C.2)",
                });
                UnregisterInboundReply::KeepTr
            }
            StateTag::InboundIdle(_) => {
                let prior = take(&mut st);
                if let ConnectionState::InboundIdle { conn_id, thread, .. } = prior {
                    thread.cancel();
                    trace::emit(&trace::Event::ThreadCancelled { peer: peer.clone() });
                    cell.set(
                        &mut st,
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                    );
                }
                UnregisterInboundReply::CommitTr
            }
            StateTag::Terminating => UnregisterInboundReply::CommitTr,
            StateTag::Inbound(df) => {
                trace::emit(&trace::Event::InvariantViolation {
                    peer: peer.clone(),
                    detail: "unregisterInbound observed Inbound (defensive transition, spec §9)",
                });
                let prior = take(&mut st);
                if let ConnectionState::Inbound { conn_id, thread, .. } = prior {
                    thread.cancel();
                    cell.set(
                        &mut st,
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                    );
                }
                UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Inbound(df)))
            }
            StateTag::Duplex => {
                trace::emit(&trace::Event::InvariantViolation {
                    peer: peer.clone(),
                    detail: "unregisterInbound observed Duplex (defensive transition, spec §9)",
                });
                let prior = take(&mut st);
                if let ConnectionState::Duplex { conn_id, thread, handle } = prior {
                    cell.set(
                        &mut st,
                        ConnectionState::OutboundDup {
                            conn_id,
                            thread,
                            handle,
                            timer: TimeoutExpired::Ticking,
                        },
                    );
                }
                UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Duplex))
            }
            tag => {
                trace::emit(&trace::Event::InvariantViolation {
                    peer: peer.clone(),
                    detail: "unregisterInbound observed a Reserved/Unnegotiated/OutboundUni/Terminated state (spec §C.2)",
                });
                UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(tag))
            }
        }
    }

    // ---- §4.7 unregisterOutbound + prune ---------------------------------

    pub fn unregister_outbound(&self, peer: &A) -> Result<(), Error<A>> {
        let map = self.table.lock();
        let Some(cell) = map.get(peer).cloned() else {
            return Ok(());
        };
        drop(map);
        let mut st = cell.lock();
        let mut run_prune_after = false;
        match st.tag() {
            StateTag::OutboundUni => {
                let prior = take(&mut st);
                if let ConnectionState::OutboundUni { conn_id, thread, .. } = prior {
                    thread.cancel();
                    cell.set(
                        &mut st,
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                    );
                }
            }
            StateTag::OutboundDup(TimeoutExpired::Expired) => {
                let prior = take(&mut st);
                if let ConnectionState::OutboundDup { conn_id, thread, .. } = prior {
                    thread.cancel();
                    cell.set(
                        &mut st,
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                    );
                }
            }
            StateTag::OutboundDup(TimeoutExpired::Ticking) => {
                let prior = take(&mut st);
                if let ConnectionState::OutboundDup {
                    conn_id,
                    thread,
                    handle,
                    ..
                } = prior
                {
                    cell.set(
                        &mut st,
                        ConnectionState::InboundIdle {
                            conn_id,
                            thread,
                            handle,
                            data_flow: DataFlow::Duplex,
                        },
                    );
                }
            }
            StateTag::InboundIdle(DataFlow::Duplex) => {
                // already cold, no-op
            }
            StateTag::Duplex => {
                let prior = take(&mut st);
                if let ConnectionState::Duplex { conn_id, thread, handle } = prior {
                    cell.set(
                        &mut st,
                        ConnectionState::Inbound {
                            conn_id,
                            thread,
                            handle,
                            data_flow: DataFlow::Duplex,
                        },
                    );
                }
                trace::emit(&trace::Event::Demoted {
                    peer: peer.clone(),
                    to: StateTag::Inbound(DataFlow::Duplex),
                });
                run_prune_after = true;
            }
            StateTag::Inbound(_) => {
                return Err(Error::ForbiddenOperation {
                    peer: peer.clone(),
                    in_state: StateTag::Inbound(DataFlow::Duplex),
                });
            }
            StateTag::ReservedOutbound => {
                return Err(Error::ForbiddenOperation {
                    peer: peer.clone(),
                    in_state: StateTag::ReservedOutbound,
                });
            }
            StateTag::Unnegotiated(prov) => {
                return Err(Error::ForbiddenOperation {
                    peer: peer.clone(),
                    in_state: StateTag::Unnegotiated(prov),
                });
            }
            StateTag::Terminating | StateTag::Terminated => {
                // no-op success
            }
            // Reachable whenever `includeInbound` negotiated `Unidirectional`
            // (spec §4.7 leaves this state undefined for `unregisterOutbound`
            // since there is no outbound usage to retire here) — a no-op
            // success, not a defensive branch: ordinary lifecycle conditions
            // must never panic (spec §7).
            StateTag::InboundIdle(DataFlow::Unidirectional) => {
                // no-op success
            }
            StateTag::OutboundDup(_) => unreachable!("Ticking/Expired matched above"),
        }
        drop(st);

        if run_prune_after {
            self.run_prune();
        }
        Ok(())
    }

    fn run_prune(&self) {
        let (admitted, candidates) = {
            let map = self.table.lock();
            let mut admitted = 0usize;
            let mut candidates = HashMap::new();
            for (addr, cell) in map.iter() {
                let st = cell.lock();
                if st.counts_toward_admission_limit() {
                    admitted += 1;
                }
                if let (Some(connection_type), Some(_thread)) = (st.connection_type(), st.thread()) {
                    candidates.insert(addr.clone(), connection_type);
                }
            }
            (admitted, candidates)
        };

        if admitted <= self.accepted_connections_hard_limit {
            return;
        }
        let k = admitted - self.accepted_connections_hard_limit;
        let victims = self.prune_policy.select_victims(&candidates, k);
        trace::emit(&trace::Event::PruneTriggered {
            admitted,
            limit: self.accepted_connections_hard_limit,
            victims: victims.len(),
        });
        for victim in victims {
            let map = self.table.lock();
            let Some(cell) = map.get(&victim).cloned() else {
                continue;
            };
            drop(map);
            let st = cell.lock();
            // Do not rewrite the victim's cell directly — its own
            // Cleanup does that once cancellation unblocks it (spec §4.7).
            if let Some(thread) = st.thread() {
                thread.cancel();
            }
            drop(st);
            trace::emit(&trace::Event::ThreadCancelled { peer: victim });
        }
    }

    // ---- §4.8 promotedToWarmRemote / demotedToColdRemote ------------------

    pub fn promoted_to_warm_remote(&self, peer: &A) -> PromoteDemoteReply {
        let map = self.table.lock();
        let Some(cell) = map.get(peer).cloned() else {
            return PromoteDemoteReply::Unsupported(UnsupportedStateReason::UnknownConnection);
        };
        drop(map);
        let mut st = cell.lock();
        match st.tag() {
            StateTag::OutboundDup(_) => {
                let prior = take(&mut st);
                if let ConnectionState::OutboundDup {
                    conn_id, thread, handle, ..
                } = prior
                {
                    cell.set(&mut st, ConnectionState::Duplex { conn_id, thread, handle });
                }
                trace::emit(&trace::Event::Promoted {
                    peer: peer.clone(),
                    to: StateTag::Duplex,
                });
                PromoteDemoteReply::Ok
            }
            StateTag::InboundIdle(df) => {
                let prior = take(&mut st);
                if let ConnectionState::InboundIdle {
                    conn_id, thread, handle, ..
                } = prior
                {
                    cell.set(
                        &mut st,
                        ConnectionState::Inbound {
                            conn_id,
                            thread,
                            handle,
                            data_flow: df,
                        },
                    );
                }
                trace::emit(&trace::Event::Promoted {
                    peer: peer.clone(),
                    to: StateTag::Inbound(df),
                });
                PromoteDemoteReply::Ok
            }
            StateTag::Inbound(_) | StateTag::Duplex => PromoteDemoteReply::Ok,
            tag => PromoteDemoteReply::Unsupported(UnsupportedStateReason::Current(tag)),
        }
    }

    pub fn demoted_to_cold_remote(&self, peer: &A) -> PromoteDemoteReply {
        let map = self.table.lock();
        let Some(cell) = map.get(peer).cloned() else {
            return PromoteDemoteReply::Unsupported(UnsupportedStateReason::UnknownConnection);
        };
        drop(map);
        let mut st = cell.lock();
        match st.tag() {
            StateTag::Inbound(df) => {
                let prior = take(&mut st);
                if let ConnectionState::Inbound {
                    conn_id, thread, handle, ..
                } = prior
                {
                    cell.set(
                        &mut st,
                        ConnectionState::InboundIdle {
                            conn_id,
                            thread,
                            handle,
                            data_flow: df,
                        },
                    );
                }
                trace::emit(&trace::Event::Demoted {
                    peer: peer.clone(),
                    to: StateTag::InboundIdle(df),
                });
                PromoteDemoteReply::Ok
            }
            StateTag::Duplex => {
                let prior = take(&mut st);
                if let ConnectionState::Duplex { conn_id, thread, handle } = prior {
                    cell.set(
                        &mut st,
                        ConnectionState::OutboundDup {
                            conn_id,
                            thread,
                            handle,
                            timer: TimeoutExpired::Ticking,
                        },
                    );
                }
                trace::emit(&trace::Event::Demoted {
                    peer: peer.clone(),
                    to: StateTag::OutboundDup(TimeoutExpired::Ticking),
                });
                PromoteDemoteReply::Ok
            }
            tag => PromoteDemoteReply::Unsupported(UnsupportedStateReason::Current(tag)),
        }
    }

    // ---- §4.10 shutdown ----------------------------------------------------

    /// Tear every tracked connection down without touching TIME_WAIT (spec
    /// §4.10). Called exactly once, by `with_connection_manager`, on every
    /// exit path.
    fn shutdown(&self) {
        self.shutdown_signal.trigger();
        let entries = self.table.snapshot();
        trace::emit(&trace::Event::Shutdown {
            live_connections: entries.len(),
        });
        for (_, cell) in entries {
            let mut st = cell.lock();
            let prior = take(&mut st);
            let thread = match prior {
                ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
                ConnectionState::Unnegotiated { thread, .. }
                | ConnectionState::OutboundUni { thread, .. }
                | ConnectionState::OutboundDup { thread, .. }
                | ConnectionState::InboundIdle { thread, .. }
                | ConnectionState::Inbound { thread, .. }
                | ConnectionState::Duplex { thread, .. }
                | ConnectionState::Terminating { thread, .. } => Some(thread),
            };
            cell.set(&mut st, ConnectionState::Terminated { error: None });
            drop(st);
            if let Some(thread) = thread {
                thread.cancel();
            }
        }
    }
}

enum PhaseA<A, H> {
    Dial(Arc<Cell<A, H>>),
    There,
    Reused {
        conn_id: ConnectionId<A>,
        handle: H,
        data_flow: DataFlow,
    },
}

/// Scoped combinator: build a `ConnectionManager` from `config`, run `f`
/// with it, and guarantee `shutdown` runs on every exit path — including a
/// panic inside `f` (spec §9 "Global state").
pub fn with_connection_manager<A, S, Han, P, D, R>(
    config: Config<A, S, Han, P, D>,
    f: impl FnOnce(&ConnectionManager<A, S, Han, P, D>) -> R,
) -> R
where
    A: PeerAddr,
    S: SocketOps<Addr = A>,
    Han: Handler<A, S::Socket>,
    P: PrunePolicy<A>,
    D: DataFlowFromVersion<Han::Version>,
{
    let cm = ConnectionManager::new(config);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&cm)));
    cm.shutdown();
    match result {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}
