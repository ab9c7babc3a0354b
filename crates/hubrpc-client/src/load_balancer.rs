use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use hubrpc_common::sync::lock;
use hubrpc_common::{HostDetail, HostInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Round-robin cursors wrap back into range once they reach this bound.
const CURSOR_WRAP: u64 = 1_000_000_000;

/// How a discovery client picks one provider among several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Same key, same host while the host list is unchanged. An empty key
    /// falls back to [`Random`](Self::Random).
    SourceHash,
    /// Least-loaded host; ties are served round-robin.
    LowestLoad,
}

struct MethodHostState {
    hosts: Vec<HostDetail>,
    cursor: u64,
    rng: StdRng,
}

/// Cached provider list for one method.
pub struct MethodHost {
    state: Mutex<MethodHostState>,
}

impl MethodHost {
    /// Create a host pool from a discovery result
    pub fn new(hosts: Vec<HostDetail>) -> Self {
        Self {
            state: Mutex::new(MethodHostState {
                hosts,
                cursor: 0,
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    /// Select a host with the given strategy
    ///
    /// Returns `None` when the pool is empty.
    pub fn select_host(&self, strategy: LoadBalanceStrategy, key: &str) -> Option<HostDetail> {
        let mut state = lock(&self.state);
        if state.hosts.is_empty() {
            return None;
        }
        let len = state.hosts.len();

        let index = match strategy {
            LoadBalanceStrategy::RoundRobin => next_cursor(&mut state.cursor, len),
            LoadBalanceStrategy::Random => state.rng.random_range(0..len),
            LoadBalanceStrategy::SourceHash if key.is_empty() => state.rng.random_range(0..len),
            LoadBalanceStrategy::SourceHash => (hash_key(key) % len as u64) as usize,
            LoadBalanceStrategy::LowestLoad => {
                let min_load = state.hosts.iter().map(|h| h.load).min()?;
                let candidates: Vec<usize> = state
                    .hosts
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.load == min_load)
                    .map(|(i, _)| i)
                    .collect();
                candidates[next_cursor(&mut state.cursor, candidates.len())]
            }
        };

        Some(state.hosts[index].clone())
    }

    /// Add a host, or update its load if it is already pooled
    pub fn append_host(&self, detail: HostDetail) {
        let mut state = lock(&self.state);
        match state.hosts.iter_mut().find(|h| h.host == detail.host) {
            Some(existing) => existing.load = detail.load,
            None => state.hosts.push(detail),
        }
    }

    /// Remove a host from the pool
    pub fn remove_host(&self, host: &HostInfo) {
        lock(&self.state).hosts.retain(|h| &h.host != host);
    }

    /// Get the number of hosts
    pub fn host_count(&self) -> usize {
        lock(&self.state).hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).hosts.is_empty()
    }

    /// Get list of all hosts
    pub fn hosts(&self) -> Vec<HostDetail> {
        lock(&self.state).hosts.clone()
    }
}

/// Current position modulo `len`, advancing the cursor.
fn next_cursor(cursor: &mut u64, len: usize) -> usize {
    let index = (*cursor % len as u64) as usize;
    *cursor += 1;
    if *cursor >= CURSOR_WRAP {
        *cursor %= len as u64;
    }
    index
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
