//! Alert aggregation: fingerprint dedup, (category, severity) grouping, and
//! windowed batch emission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use moka::sync::Cache;
use tokio::sync::broadcast;
use tracing::debug;

use tickvault_core::TaskHandle;
use tickvault_types::{AlertBatch, AlertCategory, AlertConfig, AlertItem, AlertSeverity};

type GroupKey = (AlertCategory, AlertSeverity);

/// Deduplicating, batching alert fan-out.
///
/// `submit` is cheap and lock-light: a TTL cache answers the dedup question,
/// and pending items sit in per-group vectors behind one mutex. A flusher
/// task emits batches every window; a group that reaches `max_batch_size`
/// flushes immediately from the submitting call.
pub struct AlertAggregator {
    cfg: AlertConfig,
    seen: Cache<String, ()>,
    suppressed: AtomicU64,
    pending: Mutex<HashMap<GroupKey, Vec<AlertItem>>>,
    tx: broadcast::Sender<AlertBatch>,
}

impl AlertAggregator {
    /// Build an aggregator with the given dedup/batching configuration.
    #[must_use]
    pub fn new(cfg: AlertConfig) -> Self {
        let seen = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(cfg.dedup_cooldown.max(std::time::Duration::from_millis(1)))
            .build();
        let (tx, _) = broadcast::channel(64);
        Self {
            cfg,
            seen,
            suppressed: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Subscribe to emitted batches.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AlertBatch> {
        self.tx.subscribe()
    }

    /// Submit one alert. Returns `false` when the fingerprint was suppressed.
    pub fn submit(&self, item: AlertItem) -> bool {
        if !self.cfg.dedup_cooldown.is_zero() {
            let key = item.dedup_key();
            if self.seen.get(&key).is_some() {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "alert suppressed by dedup cooldown");
                return false;
            }
            self.seen.insert(key, ());
        }

        let group = (item.category, item.severity);
        let flush_now = {
            let mut pending = self.pending.lock().expect("mutex poisoned");
            let entries = pending.entry(group).or_default();
            entries.push(item);
            entries.len() >= self.cfg.max_batch_size
        };
        if flush_now {
            self.flush_group(group);
        }
        true
    }

    /// Alerts suppressed by dedup so far.
    #[must_use]
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Flush a single group, if it has pending items.
    fn flush_group(&self, group: GroupKey) {
        let items = {
            let mut pending = self.pending.lock().expect("mutex poisoned");
            match pending.remove(&group) {
                Some(items) if !items.is_empty() => items,
                _ => return,
            }
        };
        self.emit(group, items);
    }

    /// Flush every pending group.
    pub fn flush_all(&self) {
        let drained: Vec<(GroupKey, Vec<AlertItem>)> = {
            let mut pending = self.pending.lock().expect("mutex poisoned");
            pending.drain().filter(|(_, v)| !v.is_empty()).collect()
        };
        for (group, items) in drained {
            self.emit(group, items);
        }
    }

    fn emit(&self, (category, severity): GroupKey, items: Vec<AlertItem>) {
        let mut by_source = std::collections::BTreeMap::new();
        let mut max_severity = severity;
        for item in &items {
            *by_source.entry(item.source.clone()).or_insert(0usize) += 1;
            max_severity = max_severity.max(item.severity);
        }
        let batch = AlertBatch {
            category,
            severity,
            count: items.len(),
            max_severity,
            by_source,
            items,
            emitted_at: Utc::now(),
        };
        // No subscribers is fine; batches are best-effort fan-out.
        let _ = self.tx.send(batch);
    }

    /// Spawn the windowed flusher. Stopping it flushes remaining groups.
    pub fn spawn_flusher(self: &Arc<Self>) -> TaskHandle {
        let this = Arc::clone(self);
        TaskHandle::spawn(move |mut stop| async move {
            let mut ticker = tokio::time::interval(this.cfg.window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        this.flush_all();
                        break;
                    }
                    _ = ticker.tick() => this.flush_all(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(title: &str, severity: AlertSeverity) -> AlertItem {
        AlertItem {
            category: AlertCategory::Connection,
            severity,
            title: title.to_string(),
            message: "detail".to_string(),
            source: "test".to_string(),
            fingerprint: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_suppressed() {
        let agg = AlertAggregator::new(AlertConfig::default());
        assert!(agg.submit(item("heartbeat missed", AlertSeverity::Warning)));
        assert!(!agg.submit(item("heartbeat missed", AlertSeverity::Warning)));
        assert_eq!(agg.suppressed_count(), 1);
    }

    #[tokio::test]
    async fn batch_carries_rollup() {
        let agg = AlertAggregator::new(AlertConfig {
            dedup_cooldown: Duration::ZERO,
            ..AlertConfig::default()
        });
        let mut rx = agg.subscribe();
        agg.submit(item("a", AlertSeverity::Warning));
        agg.submit(item("b", AlertSeverity::Warning));
        agg.flush_all();
        let batch = rx.recv().await.expect("batch");
        assert_eq!(batch.count, 2);
        assert_eq!(batch.by_source.get("test"), Some(&2));
        assert_eq!(batch.max_severity, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn group_reaching_max_size_flushes_immediately() {
        let agg = AlertAggregator::new(AlertConfig {
            dedup_cooldown: Duration::ZERO,
            max_batch_size: 2,
            ..AlertConfig::default()
        });
        let mut rx = agg.subscribe();
        agg.submit(item("a", AlertSeverity::Error));
        agg.submit(item("b", AlertSeverity::Error));
        // No explicit flush: the size trigger emitted the batch.
        let batch = rx.recv().await.expect("batch");
        assert_eq!(batch.count, 2);
    }

    #[tokio::test]
    async fn groups_are_keyed_by_category_and_severity() {
        let agg = AlertAggregator::new(AlertConfig {
            dedup_cooldown: Duration::ZERO,
            ..AlertConfig::default()
        });
        let mut rx = agg.subscribe();
        agg.submit(item("a", AlertSeverity::Warning));
        agg.submit(item("b", AlertSeverity::Critical));
        agg.flush_all();
        let first = rx.recv().await.expect("batch");
        let second = rx.recv().await.expect("batch");
        assert_ne!(first.severity, second.severity);
        assert_eq!(first.count + second.count, 2);
    }
}
