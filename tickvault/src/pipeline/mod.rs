//! Bounded event pipeline: non-blocking publish, drop accounting, and a
//! single consumer that drives the validator chain and the archive sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use tickvault_core::{ArchiveWriter, EventSink, TaskHandle};
use tickvault_types::{
    AlertCategory, AlertItem, AlertSeverity, EventKind, MarketEvent, PipelineConfig,
    PipelineSnapshot,
};

use crate::alerts::AlertAggregator;
use crate::health::HealthMonitor;
use crate::health::skew::SkewEstimator;
use crate::recon::Counters;
use crate::validate::{ValidatorChain, Verdict};

const RATE_ALPHA: f64 = 0.3;
const HIGH_WATER_BANDS: [f64; 2] = [0.7, 0.9];

struct RateState {
    bucket_start: Instant,
    count: u64,
    ewma: f64,
    seeded: bool,
}

/// Pipeline counters: offered/dropped totals, per-kind tallies, depth
/// tracking, and a 1 s-bucket publish-rate EWMA.
pub struct PipelineStats {
    published: AtomicU64,
    dropped: AtomicU64,
    per_kind: [AtomicU64; EventKind::ALL.len()],
    depth: AtomicU64,
    peak_depth: AtomicU64,
    stored: AtomicU64,
    store_failed: AtomicU64,
    rate: Mutex<RateState>,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            per_kind: Default::default(),
            depth: AtomicU64::new(0),
            peak_depth: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            store_failed: AtomicU64::new(0),
            rate: Mutex::new(RateState {
                bucket_start: Instant::now(),
                count: 0,
                ewma: 0.0,
                seeded: false,
            }),
        }
    }

    fn record_offered(&self, kind: EventKind) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.per_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_accepted(&self) -> u64 {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        let mut rate = self.rate.lock().expect("mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(rate.bucket_start);
        if elapsed >= Duration::from_secs(1) {
            let whole = elapsed.as_secs().min(60);
            let finished = rate.count as f64;
            rate.ewma = if rate.seeded {
                RATE_ALPHA * finished + (1.0 - RATE_ALPHA) * rate.ewma
            } else {
                finished
            };
            rate.seeded = true;
            for _ in 1..whole {
                rate.ewma *= 1.0 - RATE_ALPHA;
            }
            rate.bucket_start = now;
            rate.count = 0;
        }
        rate.count += 1;
        depth
    }

    fn record_consumed(&self) {
        // Saturating: drain accounting may race an in-flight accept.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current queue depth.
    #[must_use]
    pub fn current_depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Publish-rate EWMA over 1 s buckets.
    #[must_use]
    pub fn published_per_sec(&self) -> f64 {
        self.rate.lock().expect("mutex poisoned").ewma
    }

    /// Snapshot every counter.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        let mut per_kind = BTreeMap::new();
        for kind in EventKind::ALL {
            let n = self.per_kind[kind.index()].load(Ordering::Relaxed);
            if n > 0 {
                per_kind.insert(kind.as_str().to_string(), n);
            }
        }
        PipelineSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            per_kind,
            current_depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            published_per_sec: self.published_per_sec(),
            stored: self.stored.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything the consumer task needs besides the pipeline itself.
pub(crate) struct ConsumerParts {
    pub rx: mpsc::Receiver<MarketEvent>,
    pub archive: Arc<dyn ArchiveWriter>,
    pub chain: ValidatorChain,
    pub skew: Arc<SkewEstimator>,
}

/// Bounded MPSC pipeline. Producers call [`EventSink::try_publish`] only;
/// a single consumer drains FIFO into the validator chain and archive sink.
pub struct EventPipeline {
    tx: mpsc::Sender<MarketEvent>,
    capacity: usize,
    drain_timeout: Duration,
    accepting: AtomicBool,
    stats: Arc<PipelineStats>,
    counters: Arc<Counters>,
    alerts: Option<Arc<AlertAggregator>>,
    health: Option<Arc<HealthMonitor>>,
    band_latched: [AtomicBool; HIGH_WATER_BANDS.len()],
}

impl EventPipeline {
    /// Build the pipeline; the returned receiver feeds the consumer task.
    pub(crate) fn new(
        cfg: &PipelineConfig,
        counters: Arc<Counters>,
        alerts: Option<Arc<AlertAggregator>>,
        health: Option<Arc<HealthMonitor>>,
    ) -> (Arc<Self>, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(cfg.capacity);
        let pipeline = Arc::new(Self {
            tx,
            capacity: cfg.capacity,
            drain_timeout: cfg.drain_timeout,
            accepting: AtomicBool::new(true),
            stats: Arc::new(PipelineStats::new()),
            counters,
            alerts,
            health,
            band_latched: Default::default(),
        });
        (pipeline, rx)
    }

    /// The shared stats handle.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting publishes; subsequent offers count as drops.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn check_high_water(&self, depth: u64) {
        let frac = depth as f64 / self.capacity as f64;
        for (i, band) in HIGH_WATER_BANDS.iter().enumerate() {
            if frac >= *band && !self.band_latched[i].swap(true, Ordering::Relaxed) {
                let pct = (band * 100.0) as u32;
                warn!(depth, capacity = self.capacity, "pipeline depth crossed {pct}% high-water mark");
                if let Some(alerts) = &self.alerts {
                    alerts.submit(AlertItem {
                        category: AlertCategory::Pipeline,
                        severity: AlertSeverity::Warning,
                        title: format!("pipeline depth above {pct}%"),
                        message: format!("depth {depth} of {}", self.capacity),
                        source: "pipeline".to_string(),
                        fingerprint: Some(format!("pipeline-high-water-{pct}")),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    fn rearm_bands(&self, depth: u64) {
        let frac = depth as f64 / self.capacity as f64;
        for (i, band) in HIGH_WATER_BANDS.iter().enumerate() {
            if frac < *band {
                self.band_latched[i].store(false, Ordering::Relaxed);
            }
        }
    }

    async fn process(
        &self,
        event: MarketEvent,
        archive: &Arc<dyn ArchiveWriter>,
        chain: &ValidatorChain,
        skew: &SkewEstimator,
    ) {
        self.stats.record_consumed();
        self.rearm_bands(self.stats.current_depth());

        match chain.process(&event) {
            Verdict::Duplicate => {
                self.counters.incr_duplicate();
                debug!(symbol = %event.symbol, sequence = event.sequence, "dropped duplicate event");
            }
            Verdict::Reject(reason) => {
                self.counters.incr_rejected();
                debug!(symbol = %event.symbol, %reason, "rejected event");
            }
            Verdict::Accept { integrity } => {
                self.counters.incr_validated();
                let skew_ms = event.skew_ms() as f64;
                skew.observe(&event.provider, skew_ms);
                if let Some(health) = &self.health {
                    health.record_latency(&event.provider, skew_ms.max(0.0));
                }

                match archive.write(&event).await {
                    Ok(()) => {
                        self.counters.incr_stored();
                        self.stats.stored.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.counters.incr_store_failed();
                        self.stats.store_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %event.symbol, error = %err, "archive write failed");
                        if let Some(alerts) = &self.alerts {
                            alerts.submit(AlertItem {
                                category: AlertCategory::Storage,
                                severity: AlertSeverity::Error,
                                title: "archive write failed".to_string(),
                                message: err.to_string(),
                                source: "pipeline".to_string(),
                                fingerprint: Some("archive-write-failed".to_string()),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }

                for anomaly in integrity {
                    // Best-effort: a full queue drops the anomaly like any
                    // other publish.
                    let _ = self.try_publish(anomaly);
                }
            }
        }
    }

    /// Spawn the single consumer. Stopping the handle drains up to the
    /// configured drain timeout, then abandons the rest as `store_failed`.
    pub(crate) fn spawn_consumer(self: &Arc<Self>, parts: ConsumerParts) -> TaskHandle {
        let this = Arc::clone(self);
        let ConsumerParts {
            mut rx,
            archive,
            chain,
            skew,
        } = parts;
        TaskHandle::spawn(move |mut stop| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => {
                        this.close();
                        this.drain(&mut rx, &archive, &chain, &skew).await;
                        break;
                    }
                    maybe = rx.recv() => match maybe {
                        Some(event) => this.process(event, &archive, &chain, &skew).await,
                        None => break,
                    },
                }
            }
            if let Err(err) = archive.flush().await {
                warn!(error = %err, "archive flush failed at consumer exit");
            }
        })
    }

    async fn drain(
        &self,
        rx: &mut mpsc::Receiver<MarketEvent>,
        archive: &Arc<dyn ArchiveWriter>,
        chain: &ValidatorChain,
        skew: &SkewEstimator,
    ) {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if Instant::now() >= deadline {
                let mut abandoned = 0u64;
                while rx.try_recv().is_ok() {
                    self.stats.record_consumed();
                    abandoned += 1;
                }
                if abandoned > 0 {
                    self.counters.add_store_failed(abandoned);
                    self.stats
                        .store_failed
                        .fetch_add(abandoned, Ordering::Relaxed);
                    warn!(abandoned, "drain timeout reached; abandoning queued events");
                }
                break;
            }
            match rx.try_recv() {
                Ok(event) => self.process(event, archive, chain, skew).await,
                Err(_) => break,
            }
        }
    }
}

impl EventSink for EventPipeline {
    fn try_publish(&self, event: MarketEvent) -> bool {
        self.counters.incr_received();
        self.stats.record_offered(event.kind());
        if let Some(health) = &self.health {
            health.record_event(&event.provider);
        }

        if !self.accepting.load(Ordering::SeqCst) {
            self.stats.record_dropped();
            self.counters.incr_pipeline_dropped();
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.incr_pipeline_accepted();
                let depth = self.stats.record_accepted();
                self.check_high_water(depth);
                true
            }
            Err(_) => {
                self.stats.record_dropped();
                self.counters.incr_pipeline_dropped();
                false
            }
        }
    }
}
