//! # Metrics and Monitoring
//!
//! Counters for arena and transaction activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Arena metrics
    entries_allocated: AtomicU64,
    pages_allocated: AtomicU64,
    alloc_failures: AtomicU64,
    mappings_created: AtomicU64,
    mappings_removed: AtomicU64,
    entries_reclaimed: AtomicU64,
    address_retries: AtomicU64,

    // Transaction metrics
    commits: AtomicU64,
    aborts: AtomicU64,
    fatal_inconsistencies: AtomicU64,
    versions_linked: AtomicU64,
    cas_retries: AtomicU64,
    versions_reclaimed: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful arena allocation
    pub fn record_alloc(&self, pages: u64) {
        self.inner.entries_allocated.fetch_add(1, Ordering::Relaxed);
        self.inner.pages_allocated.fetch_add(pages, Ordering::Relaxed);
    }

    /// Record a refused arena allocation
    pub fn record_alloc_failure(&self) {
        self.inner.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_map(&self) {
        self.inner.mappings_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmap(&self) {
        self.inner.mappings_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim(&self) {
        self.inner.entries_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lost race for a discovered virtual address
    pub fn record_address_retry(&self) {
        self.inner.address_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.inner.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.inner.fatal_inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_version_linked(&self) {
        self.inner.versions_linked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cas_retry(&self) {
        self.inner.cas_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_versions_reclaimed(&self, count: u64) {
        self.inner.versions_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_allocated: self.inner.entries_allocated.load(Ordering::Relaxed),
            pages_allocated: self.inner.pages_allocated.load(Ordering::Relaxed),
            alloc_failures: self.inner.alloc_failures.load(Ordering::Relaxed),
            mappings_created: self.inner.mappings_created.load(Ordering::Relaxed),
            mappings_removed: self.inner.mappings_removed.load(Ordering::Relaxed),
            entries_reclaimed: self.inner.entries_reclaimed.load(Ordering::Relaxed),
            address_retries: self.inner.address_retries.load(Ordering::Relaxed),
            commits: self.inner.commits.load(Ordering::Relaxed),
            aborts: self.inner.aborts.load(Ordering::Relaxed),
            fatal_inconsistencies: self.inner.fatal_inconsistencies.load(Ordering::Relaxed),
            versions_linked: self.inner.versions_linked.load(Ordering::Relaxed),
            cas_retries: self.inner.cas_retries.load(Ordering::Relaxed),
            versions_reclaimed: self.inner.versions_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub entries_allocated: u64,
    pub pages_allocated: u64,
    pub alloc_failures: u64,
    pub mappings_created: u64,
    pub mappings_removed: u64,
    pub entries_reclaimed: u64,
    pub address_retries: u64,
    pub commits: u64,
    pub aborts: u64,
    pub fatal_inconsistencies: u64,
    pub versions_linked: u64,
    pub cas_retries: u64,
    pub versions_reclaimed: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Start new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log duration
    pub fn stop(self) {
        let duration = self.elapsed();
        tracing::debug!(
            name = self.name,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
