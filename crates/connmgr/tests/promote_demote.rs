mod common;

use std::thread;
use std::time::Duration;

use common::{connected_pair, test_config, ScriptedHandler};
use connmgr::{ConnectOutcome, DataFlow, Error, PromoteDemoteReply, StateTag, UnregisterInboundReply, UnsupportedStateReason};

/// Negotiate an inbound connection up through `promotedToWarmRemote` and a
/// reusing `requestOutbound` call, landing on a live `Duplex` connection —
/// the starting point shared by several of the tests below. Returns the
/// client stream too; dropping it would close the loopback pair out from
/// under the connection's keepalive read loop.
fn connected_duplex(
    peer_version: u8,
) -> (
    connmgr::ConnectionManager<std::net::SocketAddr, connmgr::TcpSocketOps, ScriptedHandler, connmgr::RandomPrunePolicy, impl Fn(u8) -> DataFlow>,
    std::net::TcpStream,
    std::net::SocketAddr,
) {
    let (client, server, peer) = connected_pair();
    let handler = ScriptedHandler::new();
    handler.script_version(peer, peer_version);
    let cm = connmgr::ConnectionManager::new(test_config(handler));
    cm.include_inbound(server, peer).unwrap();
    cm.promoted_to_warm_remote(&peer);
    let reused = cm.request_outbound(peer).unwrap();
    match reused {
        ConnectOutcome::Connected { data_flow, .. } => assert_eq!(data_flow, DataFlow::Duplex),
        other => panic!("expected Connected, got {other:?}"),
    }
    (cm, client, peer)
}

/// promotedToWarmRemote: `InboundIdle` -> `Inbound` (spec §4.8).
#[test]
fn promote_inbound_idle_to_inbound() {
    common::init_tracing();
    let (_client, server, peer) = connected_pair();
    let handler = ScriptedHandler::new();
    handler.script_version(peer, 1);
    let cm = connmgr::ConnectionManager::new(test_config(handler));
    cm.include_inbound(server, peer).unwrap();

    assert_eq!(cm.promoted_to_warm_remote(&peer), PromoteDemoteReply::Ok);
    // Idempotent in the already-warm state too.
    assert_eq!(cm.promoted_to_warm_remote(&peer), PromoteDemoteReply::Ok);
}

/// demotedToColdRemote: `Inbound` -> `InboundIdle`, then a second demote on
/// an unknown peer reports `Unsupported`.
#[test]
fn demote_inbound_to_idle_then_unknown_peer() {
    common::init_tracing();
    let (_client, server, peer) = connected_pair();
    let handler = ScriptedHandler::new();
    handler.script_version(peer, 1);
    let cm = connmgr::ConnectionManager::new(test_config(handler));
    cm.include_inbound(server, peer).unwrap();
    cm.promoted_to_warm_remote(&peer);

    assert_eq!(cm.demoted_to_cold_remote(&peer), PromoteDemoteReply::Ok);

    let unknown: std::net::SocketAddr = "198.51.100.7:1".parse().unwrap();
    assert_eq!(
        cm.demoted_to_cold_remote(&unknown),
        PromoteDemoteReply::Unsupported(UnsupportedStateReason::UnknownConnection)
    );
}

/// unregisterOutbound on a `Duplex` connection downgrades it to `Inbound`
/// rather than tearing it down, since the inbound half is still live
/// (spec §4.7).
#[test]
fn unregister_outbound_downgrades_duplex_to_inbound() {
    common::init_tracing();
    let (_client, server, peer) = connected_pair();
    let handler = ScriptedHandler::new();
    handler.script_version(peer, 1);
    let cm = connmgr::ConnectionManager::new(test_config(handler));
    cm.include_inbound(server, peer).unwrap();
    cm.promoted_to_warm_remote(&peer); // -> Inbound
    let reused = cm.request_outbound(peer).unwrap(); // -> Duplex
    match reused {
        ConnectOutcome::Connected { data_flow, .. } => assert_eq!(data_flow, DataFlow::Duplex),
        other => panic!("expected Connected, got {other:?}"),
    }

    cm.unregister_outbound(&peer).unwrap();
    assert_eq!(cm.number_of_connections(), 1);

    // The connection is still alive as `Inbound`; a further
    // `unregisterOutbound` on a peer with no outbound usage is a no-op.
    assert!(cm.unregister_outbound(&peer).is_err());
}

/// `unregisterOutbound` on a peer with no tracked entry is an idempotent
/// no-op, not an error (spec §4.7).
#[test]
fn unregister_outbound_on_unknown_peer_is_idempotent() {
    common::init_tracing();
    let cm = connmgr::ConnectionManager::new(test_config(ScriptedHandler::new()));
    let peer: std::net::SocketAddr = "198.51.100.9:1".parse().unwrap();
    cm.unregister_outbound(&peer).unwrap();
    cm.unregister_outbound(&peer).unwrap();
    assert_eq!(cm.number_of_connections(), 0);
}

/// `requestOutbound` against a peer already negotiated `Unidirectional` is
/// forbidden: that data flow was chosen precisely because the other
/// direction isn't wanted (spec §4.5).
#[test]
fn outbound_is_forbidden_for_unidirectional_peer() {
    common::init_tracing();
    let (_client, server, peer) = connected_pair();
    let handler = ScriptedHandler::new();
    handler.script_version(peer, 2); // test_config maps version != 1 to Unidirectional
    let cm = connmgr::ConnectionManager::new(test_config(handler));
    cm.include_inbound(server, peer).unwrap();

    match cm.request_outbound(peer) {
        Err(Error::ForbiddenConnection { .. }) => {}
        other => panic!("expected ForbiddenConnection, got {other:?}"),
    }
}

/// `unregisterInbound` on a live `Duplex` connection is a defensive
/// transition (spec §9): it downgrades to `OutboundDup(Ticking)` rather than
/// refusing outright, but still reports `Unsupported` since a correct
/// caller should never observe `Duplex` here.
#[test]
fn unregister_inbound_defensive_duplex_arm() {
    common::init_tracing();
    let (cm, _client, peer) = connected_duplex(1);

    assert_eq!(
        cm.unregister_inbound(&peer),
        UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Duplex))
    );
    // The connection survived as `OutboundDup(Ticking)`, not torn down.
    assert_eq!(cm.number_of_connections(), 1);
}

/// `unregisterInbound` on a live `Inbound` connection is likewise defensive:
/// it cancels the thread and commits to `Terminating`, but still reports
/// `Unsupported` for the same reason.
#[test]
fn unregister_inbound_defensive_inbound_arm() {
    common::init_tracing();
    let (cm, _client, peer) = connected_duplex(1);
    // Duplex -> Inbound (spec §4.7's `unregisterOutbound` downgrade).
    cm.unregister_outbound(&peer).unwrap();

    assert_eq!(
        cm.unregister_inbound(&peer),
        UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Inbound(DataFlow::Duplex)))
    );

    for _ in 0..50 {
        if cm.number_of_connections() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("entry was never removed after the defensive Inbound unregisterInbound transition");
}

/// `unregisterInbound` called twice on a `Duplex` connection walks
/// `OutboundDup(Ticking)` to `OutboundDup(Expired)` — the second call hits
/// the `Expired` no-op arm instead of re-arming the timer (spec §C.2).
#[test]
fn unregister_inbound_twice_ticks_outbound_dup_to_expired() {
    common::init_tracing();
    let (cm, _client, peer) = connected_duplex(1);

    assert_eq!(
        cm.unregister_inbound(&peer),
        UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Duplex))
    );
    // Second call observes `OutboundDup(Ticking)` from the first, not
    // `Duplex` again.
    assert_eq!(cm.unregister_inbound(&peer), UnregisterInboundReply::KeepTr);

    // `unregisterOutbound` on the now-`Expired` timer tears the connection
    // down rather than downgrading it to `InboundIdle`.
    cm.unregister_outbound(&peer).unwrap();
    for _ in 0..50 {
        if cm.number_of_connections() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("entry was never removed after unregisterOutbound on an expired OutboundDup timer");
}

/// `unregisterOutbound` on an `OutboundDup(Ticking)` connection downgrades
/// it to `InboundIdle` rather than tearing it down — the inbound half is
/// still within its grace period and stays live.
#[test]
fn unregister_outbound_downgrades_outbound_dup_ticking_to_inbound_idle() {
    common::init_tracing();
    let (cm, _client, peer) = connected_duplex(1);

    assert_eq!(
        cm.unregister_inbound(&peer),
        UnregisterInboundReply::Unsupported(UnsupportedStateReason::Current(StateTag::Duplex))
    );
    cm.unregister_outbound(&peer).unwrap();
    assert_eq!(cm.number_of_connections(), 1);

    // The connection is alive as `InboundIdle`: a further `unregisterInbound`
    // hits the ordinary (non-defensive) `InboundIdle` arm and commits it.
    assert_eq!(cm.unregister_inbound(&peer), UnregisterInboundReply::CommitTr);
}
