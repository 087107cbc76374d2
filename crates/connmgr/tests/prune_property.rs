//! Property test for the admission-limit invariant (spec §8, property 5):
//! pruning never removes more than it needs to, and never fewer.

use std::collections::HashMap;
use std::net::SocketAddr;

use connmgr::state::{ConnectionType, Provenance};
use connmgr::{PrunePolicy, RandomPrunePolicy};
use quickcheck::{quickcheck, TestResult};

fn addr(n: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 1024 + n).parse().unwrap()
}

fn candidate_pool(count: u8) -> HashMap<SocketAddr, ConnectionType> {
    (0..count)
        .map(|i| (addr(i as u16), ConnectionType::UnnegotiatedConn(Provenance::Inbound)))
        .collect()
}

fn victim_count_matches_k_bounded_by_pool(pool_size: u8, k: u8, seed: u64) -> TestResult {
    let candidates = candidate_pool(pool_size);
    let policy = RandomPrunePolicy::seeded(seed);
    let victims = policy.select_victims(&candidates, k as usize);

    let expected = (k as usize).min(candidates.len());
    if victims.len() != expected {
        return TestResult::failed();
    }
    let unique: std::collections::HashSet<_> = victims.iter().collect();
    if unique.len() != victims.len() {
        return TestResult::failed();
    }
    if !victims.iter().all(|v| candidates.contains_key(v)) {
        return TestResult::failed();
    }
    TestResult::passed()
}

quickcheck! {
    fn prune_bound_invariant(pool_size: u8, k: u8, seed: u64) -> TestResult {
        victim_count_matches_k_bounded_by_pool(pool_size, k, seed)
    }
}
