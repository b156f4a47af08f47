//! Registry-wide counters.
//!
//! `RegistryMetricsStorage` is written on the hot path with relaxed atomics;
//! `RegistryMetrics` is the read-only handle given to callers. All counters are
//! monotonic and never reset.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub(crate) struct RegistryMetricsStorage {
    pub(crate) starts: Arc<AtomicU64>,
    pub(crate) start_failures: Arc<AtomicU64>,
    pub(crate) hits: Arc<AtomicU64>,
    pub(crate) evictions: Arc<AtomicU64>,
    pub(crate) unsolicited_stops: Arc<AtomicU64>,
}

impl RegistryMetricsStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot handle over the registry counters.
#[derive(Debug, Clone)]
pub struct RegistryMetrics {
    storage: RegistryMetricsStorage,
}

impl RegistryMetrics {
    pub(crate) fn new(storage: RegistryMetricsStorage) -> Self {
        Self { storage }
    }

    /// Start operations issued (successful or not).
    pub fn starts_total(&self) -> u64 {
        self.storage.starts.load(Ordering::Relaxed)
    }

    pub fn start_failures_total(&self) -> u64 {
        self.storage.start_failures.load(Ordering::Relaxed)
    }

    /// `get` calls served by an already-running container.
    pub fn hits_total(&self) -> u64 {
        self.storage.hits.load(Ordering::Relaxed)
    }

    pub fn evictions_total(&self) -> u64 {
        self.storage.evictions.load(Ordering::Relaxed)
    }

    /// Containers that terminated without the registry asking them to.
    pub fn unsolicited_stops_total(&self) -> u64 {
        self.storage.unsolicited_stops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_sees_storage_updates() {
        let storage = RegistryMetricsStorage::new();
        let metrics = RegistryMetrics::new(storage.clone());

        RegistryMetricsStorage::incr(&storage.starts);
        RegistryMetricsStorage::incr(&storage.starts);
        RegistryMetricsStorage::incr(&storage.evictions);

        assert_eq!(metrics.starts_total(), 2);
        assert_eq!(metrics.evictions_total(), 1);
        assert_eq!(metrics.hits_total(), 0);
    }
}
