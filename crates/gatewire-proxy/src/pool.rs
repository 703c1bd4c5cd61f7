//! Backend server pool
//!
//! Workers pick backends round robin. Health is a per-backend atomic flag
//! flipped by whoever observes a connect failure or success; workers only
//! read it.

use gatewire_common::config::BackendAddress;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{info, warn};

#[derive(Debug)]
pub struct BackendEntry {
    pub address: BackendAddress,
    healthy: AtomicBool,
    connections: AtomicU64,
    failures: AtomicU64,
}

impl BackendEntry {
    fn new(address: BackendAddress) -> Self {
        Self {
            address,
            healthy: AtomicBool::new(true),
            connections: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<BackendEntry>,
    next: AtomicUsize,
}

impl BackendPool {
    pub fn new(addresses: Vec<BackendAddress>) -> Self {
        Self {
            backends: addresses.into_iter().map(BackendEntry::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Candidate backends for one connection attempt: healthy ones first in
    /// round-robin order, then the unhealthy ones as a last resort
    pub fn candidates(&self) -> Vec<usize> {
        let len = self.backends.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        let order = (0..len).map(|i| (start + i) % len);

        let (healthy, unhealthy): (Vec<usize>, Vec<usize>) =
            order.partition(|&i| self.backends[i].is_healthy());
        healthy.into_iter().chain(unhealthy).collect()
    }

    pub fn get(&self, index: usize) -> Option<&BackendEntry> {
        self.backends.get(index)
    }

    pub fn mark_up(&self, index: usize) {
        if let Some(entry) = self.backends.get(index) {
            entry.connections.fetch_add(1, Ordering::Relaxed);
            if !entry.healthy.swap(true, Ordering::Relaxed) {
                info!(backend = %entry.address, "Backend is reachable again");
            }
        }
    }

    pub fn mark_down(&self, index: usize) {
        if let Some(entry) = self.backends.get(index) {
            entry.failures.fetch_add(1, Ordering::Relaxed);
            if entry.healthy.swap(false, Ordering::Relaxed) {
                warn!(backend = %entry.address, "Backend marked down");
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendEntry> {
        self.backends.iter()
    }
}
