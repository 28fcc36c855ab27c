//! Lightweight global metrics for LayerVault.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Snapshot operations (prepare/view/commit/remove)
//! - Metadata store transactions
//! - Cleanup on error paths / usage accounting

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Snapshot operations -----
static PREPARES_TOTAL: AtomicU64 = AtomicU64::new(0);
static VIEWS_TOTAL: AtomicU64 = AtomicU64::new(0);
static COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static REMOVES_TOTAL: AtomicU64 = AtomicU64::new(0);

// ----- Metadata store -----
static META_COMMITS: AtomicU64 = AtomicU64::new(0);
static META_ROLLBACKS: AtomicU64 = AtomicU64::new(0);
static META_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Error paths / accounting -----
static STORAGE_CLEANUP_FAILURES: AtomicU64 = AtomicU64::new(0);
static STORAGE_RESTORES: AtomicU64 = AtomicU64::new(0);
static USAGE_CLAMPED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub prepares_total: u64,
    pub views_total: u64,
    pub commits_total: u64,
    pub removes_total: u64,

    pub meta_commits: u64,
    pub meta_rollbacks: u64,
    pub meta_bytes_written: u64,

    pub storage_cleanup_failures: u64,
    pub storage_restores: u64,
    pub usage_clamped: u64,
}

impl MetricsSnapshot {
    pub fn rollback_ratio(&self) -> f64 {
        let total = self.meta_commits + self.meta_rollbacks;
        if total == 0 {
            0.0
        } else {
            self.meta_rollbacks as f64 / total as f64
        }
    }
}

// ----- Recorders (snapshot operations) -----
pub fn record_prepare() {
    PREPARES_TOTAL.fetch_add(1, Ordering::Relaxed);
}
pub fn record_view() {
    VIEWS_TOTAL.fetch_add(1, Ordering::Relaxed);
}
pub fn record_commit() {
    COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}
pub fn record_remove() {
    REMOVES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (metadata store) -----
pub fn record_meta_commit(bytes: usize) {
    META_COMMITS.fetch_add(1, Ordering::Relaxed);
    META_BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}
pub fn record_meta_rollback() {
    META_ROLLBACKS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (error paths / accounting) -----
pub fn record_cleanup_failure() {
    STORAGE_CLEANUP_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_storage_restore() {
    STORAGE_RESTORES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_usage_clamped() {
    USAGE_CLAMPED.fetch_add(1, Ordering::Relaxed);
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        prepares_total: PREPARES_TOTAL.load(Ordering::Relaxed),
        views_total: VIEWS_TOTAL.load(Ordering::Relaxed),
        commits_total: COMMITS_TOTAL.load(Ordering::Relaxed),
        removes_total: REMOVES_TOTAL.load(Ordering::Relaxed),
        meta_commits: META_COMMITS.load(Ordering::Relaxed),
        meta_rollbacks: META_ROLLBACKS.load(Ordering::Relaxed),
        meta_bytes_written: META_BYTES_WRITTEN.load(Ordering::Relaxed),
        storage_cleanup_failures: STORAGE_CLEANUP_FAILURES.load(Ordering::Relaxed),
        storage_restores: STORAGE_RESTORES.load(Ordering::Relaxed),
        usage_clamped: USAGE_CLAMPED.load(Ordering::Relaxed),
    }
}
