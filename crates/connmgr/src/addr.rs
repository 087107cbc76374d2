//! Peer address abstraction.
//!
//! The connection manager is parametric over the address type a transport
//! uses to name a peer; it only needs to hash it, compare it, print it, and
//! classify it into an address family for local-bind selection.

use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;

/// Coarse classification of an address, used to pick a local bind address
/// (`Config::ipv4_address` / `Config::ipv6_address`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    Other,
}

/// An opaque, hashable peer identifier.
///
/// Implemented for `std::net::SocketAddr` out of the box; anything a
/// transport names a peer with (onion address, pubkey-derived identity, ...)
/// can implement this instead.
pub trait PeerAddr: Eq + Hash + Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn address_family(&self) -> AddressFamily;
}

impl PeerAddr for SocketAddr {
    fn address_family(&self) -> AddressFamily {
        match self {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// A connection identifier: the peer's address plus the local address the
/// socket ended up bound to. The local half is only known after `bind` or
/// `connect` completes, so it is filled in once the socket exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId<A> {
    pub remote: A,
    pub local: SocketAddr,
}

impl<A: fmt::Display> fmt::Display for ConnectionId<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (local {})", self.remote, self.local)
    }
}

impl<A> ConnectionId<A> {
    pub fn new(remote: A, local: SocketAddr) -> Self {
        Self { remote, local }
    }
}
