//! The `PrunePolicy` interface (spec §6): a pure selection of a victim set
//! among admissible peers, invoked when the hard admission limit is
//! exceeded (spec §4.7).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addr::PeerAddr;
use crate::state::ConnectionType;

/// Pure function `(candidates, k) -> victim set` of size `k` (spec §6).
/// Implementations must not perform I/O or mutate the connection manager —
/// the CM performs the actual cancellation after the policy returns.
pub trait PrunePolicy<A: PeerAddr>: Send + Sync + 'static {
    fn select_victims(&self, candidates: &HashMap<A, ConnectionType>, k: usize) -> Vec<A>;
}

/// Uniform-random victim selection, grounded in the teacher's own peer
/// sampling (`fsm/peermgr.rs::query`, `maintain_connections`, both of which
/// draw via `fastrand::Rng::usize(..n)`).
pub struct RandomPrunePolicy {
    rng: Mutex<fastrand::Rng>,
}

impl RandomPrunePolicy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Deterministic variant for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomPrunePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PeerAddr> PrunePolicy<A> for RandomPrunePolicy {
    fn select_victims(&self, candidates: &HashMap<A, ConnectionType>, k: usize) -> Vec<A> {
        let mut pool: Vec<&A> = candidates.keys().collect();
        let k = k.min(pool.len());
        let mut rng = self.rng.lock().unwrap();
        let mut victims = Vec::with_capacity(k);
        for _ in 0..k {
            let i = rng.usize(..pool.len());
            victims.push(pool.swap_remove(i).clone());
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Provenance;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn selects_exactly_k_distinct_victims() {
        let mut candidates = HashMap::new();
        for port in 0..5 {
            candidates.insert(addr(port), ConnectionType::UnnegotiatedConn(Provenance::Inbound));
        }
        let policy = RandomPrunePolicy::seeded(7);
        let victims = policy.select_victims(&candidates, 3);
        assert_eq!(victims.len(), 3);
        let unique: std::collections::HashSet<_> = victims.iter().collect();
        assert_eq!(unique.len(), 3);
        assert!(victims.iter().all(|v| candidates.contains_key(v)));
    }

    #[test]
    fn caps_at_candidate_pool_size() {
        let mut candidates = HashMap::new();
        candidates.insert(addr(0), ConnectionType::DuplexConn);
        let policy = RandomPrunePolicy::seeded(1);
        assert_eq!(policy.select_victims(&candidates, 10).len(), 1);
    }
}
