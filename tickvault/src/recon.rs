//! Stage-linking reconciliation counters.
//!
//! One `Counters` value is assembled at startup and threaded through every
//! component as an `Arc`; all fields are atomics so producers, the consumer,
//! and monitors mutate without locks and readers snapshot without tearing a
//! whole-struct view (individual fields may be one increment apart, which the
//! residual accounts for).

use std::sync::atomic::{AtomicU64, Ordering};

use tickvault_types::ReconciliationSnapshot;

/// Process-wide reconciliation counters.
///
/// Quiescent identity:
/// `received == duplicates + rejected + pipeline_dropped + store_failed + stored + unaccounted`.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    received_duplicates: AtomicU64,
    validated: AtomicU64,
    rejected: AtomicU64,
    pipeline_accepted: AtomicU64,
    pipeline_dropped: AtomicU64,
    stored: AtomicU64,
    store_failed: AtomicU64,
    unaccounted: AtomicU64,
}

impl Counters {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An event arrived from a provider.
    pub fn incr_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// An event was dropped as a sequence duplicate.
    pub fn incr_duplicate(&self) {
        self.received_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// An event passed sanity validation.
    pub fn incr_validated(&self) {
        self.validated.fetch_add(1, Ordering::Relaxed);
    }

    /// An event was rejected by sanity validation.
    pub fn incr_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// The pipeline accepted an event into the queue.
    pub fn incr_pipeline_accepted(&self) {
        self.pipeline_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// The pipeline refused an event (full or shut down).
    pub fn incr_pipeline_dropped(&self) {
        self.pipeline_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// The archive acknowledged an event.
    pub fn incr_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// The archive failed an event, or drain abandoned it.
    pub fn incr_store_failed(&self) {
        self.store_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add several store failures at once (drain abandonment).
    pub fn add_store_failed(&self, n: u64) {
        self.store_failed.fetch_add(n, Ordering::Relaxed);
    }

    /// An invariant-violation path acknowledged loss it cannot place.
    pub fn incr_unaccounted(&self) {
        self.unaccounted.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    #[must_use]
    pub fn snapshot(&self) -> ReconciliationSnapshot {
        ReconciliationSnapshot {
            received: self.received.load(Ordering::Relaxed),
            received_duplicates: self.received_duplicates.load(Ordering::Relaxed),
            validated: self.validated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pipeline_accepted: self.pipeline_accepted.load(Ordering::Relaxed),
            pipeline_dropped: self.pipeline_dropped.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            unaccounted: self.unaccounted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let c = Counters::new();
        c.incr_received();
        c.incr_received();
        c.incr_pipeline_accepted();
        c.incr_stored();
        c.incr_pipeline_dropped();
        let snap = c.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.pipeline_accepted, 1);
        assert_eq!(snap.stored, 1);
        assert_eq!(snap.pipeline_dropped, 1);
        assert_eq!(snap.residual(), 0);
    }
}
