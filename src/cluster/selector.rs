//! Candidate host selection
//!
//! Each service is backed by at most `limit` nodes. When the cluster has
//! more nodes than that, every node draws a random priority and the
//! `limit` highest priorities win. The working set never grows past
//! `limit + 1` entries, so one pass over the node set is enough.
//!
//! Selection does not look at the per-node load counters: it is uniform per
//! call. The counters are only a record of how the cycle spread services.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rand::Rng;

use super::service::NodeSet;

/// Default number of candidate hosts per service
pub const DEFAULT_HOST_LIMIT: usize = 3;

/// Picks a bounded set of backend hosts per service
#[derive(Debug, Clone, Copy)]
pub struct HostSelector {
    limit: usize,
}

impl Default for HostSelector {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_LIMIT)
    }
}

impl HostSelector {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Choose `min(limit, nodes.len())` distinct hosts and bump their counters.
    ///
    /// The returned list is sorted by hostname.
    pub fn select<R: Rng>(&self, nodes: &mut NodeSet, rng: &mut R) -> Vec<String> {
        let mut hosts = if self.limit >= nodes.len() {
            nodes.hostnames().map(str::to_string).collect::<Vec<_>>()
        } else {
            bounded_sample(nodes.hostnames(), self.limit, rng)
        };
        hosts.sort();

        for host in &hosts {
            nodes.record_assignment(host);
        }
        hosts
    }
}

/// Keep the `limit` highest random priorities out of `candidates`.
fn bounded_sample<'a, R, I>(candidates: I, limit: usize, rng: &mut R) -> Vec<String>
where
    R: Rng,
    I: Iterator<Item = &'a str>,
{
    // Min-heap on priority: the top is always the entry to evict.
    let mut working: BinaryHeap<Reverse<(u64, &'a str)>> = BinaryHeap::with_capacity(limit + 1);

    for host in candidates {
        working.push(Reverse((rng.gen::<u64>(), host)));
        if working.len() > limit {
            working.pop();
        }
    }

    working
        .into_iter()
        .map(|Reverse((_, host))| host.to_string())
        .collect()
}
