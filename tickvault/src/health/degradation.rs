//! Composite provider degradation scoring and failover selection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use tickvault_core::TaskHandle;
use tickvault_types::{
    ComponentScores, DegradationConfig, DegradationScore, ProviderKey, Recommendation, VaultError,
};

use super::HealthMonitor;

/// Degradation transition, published on a broadcast channel.
#[derive(Debug, Clone)]
pub enum DegradationEvent {
    /// The provider's composite crossed the degradation threshold.
    Degraded {
        /// Affected provider.
        provider: ProviderKey,
        /// Composite score at the transition.
        composite: f64,
    },
    /// The provider stayed below the threshold for two evaluations.
    Recovered {
        /// Affected provider.
        provider: ProviderKey,
    },
}

#[derive(Default)]
struct DegradedTrack {
    degraded: bool,
    below_streak: u32,
}

/// Weighted scorer over connection, latency, error-rate, and reconnect
/// components; evaluations are snapshot-based and may be up to one interval
/// stale, never torn.
pub struct DegradationScorer {
    cfg: DegradationConfig,
    outcomes: Mutex<HashMap<ProviderKey, VecDeque<(Instant, bool)>>>,
    last: RwLock<HashMap<ProviderKey, DegradationScore>>,
    tracks: Mutex<HashMap<ProviderKey, DegradedTrack>>,
    events: broadcast::Sender<DegradationEvent>,
}

impl DegradationScorer {
    /// Build a scorer; rejects weight sets that do not sum to 1.0.
    pub fn new(cfg: DegradationConfig) -> Result<Self, VaultError> {
        cfg.weights.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            cfg,
            outcomes: Mutex::new(HashMap::new()),
            last: RwLock::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Subscribe to degraded/recovered transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DegradationEvent> {
        self.events.subscribe()
    }

    /// Record one provider-operation outcome into the sliding error window.
    pub fn record_outcome(&self, provider: &ProviderKey, ok: bool) {
        let mut guard = self.outcomes.lock().expect("mutex poisoned");
        guard
            .entry(provider.clone())
            .or_default()
            .push_back((Instant::now(), ok));
    }

    fn error_rate(&self, provider: &ProviderKey) -> f64 {
        let mut guard = self.outcomes.lock().expect("mutex poisoned");
        let Some(window) = guard.get_mut(provider) else {
            return 0.0;
        };
        let now = Instant::now();
        while let Some((t, _)) = window.front() {
            if now.duration_since(*t) > self.cfg.error_window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.is_empty() {
            return 0.0;
        }
        let failures = window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / window.len() as f64
    }

    /// Evaluate every channel the monitor knows about.
    ///
    /// Fires `Degraded` on an upward threshold crossing and `Recovered` after
    /// two consecutive evaluations below it.
    pub fn evaluate(&self, health: &HealthMonitor) -> Vec<DegradationScore> {
        let now = Utc::now();
        let mut scores = Vec::new();
        for conn in health.snapshot() {
            let provider = conn.provider.clone();

            let connection = if conn.connected {
                f64::from(conn.missed_heartbeats)
                    / f64::from(self.cfg.missed_heartbeat_ceiling.max(1))
            } else {
                1.0
            }
            .min(1.0);

            let p95 = conn.latency.p95_ms;
            let latency = if p95 <= self.cfg.latency_threshold_ms {
                0.0
            } else {
                ((p95 - self.cfg.latency_threshold_ms)
                    / (self.cfg.latency_max_ms - self.cfg.latency_threshold_ms))
                    .clamp(0.0, 1.0)
            };

            let rate = self.error_rate(&provider);
            let error_rate = if rate <= self.cfg.error_rate_threshold {
                0.0
            } else {
                ((rate - self.cfg.error_rate_threshold) / (1.0 - self.cfg.error_rate_threshold))
                    .clamp(0.0, 1.0)
            };

            let rph = health.reconnects_last_hour(&provider);
            let reconnect = (rph / self.cfg.max_reconnects_per_hour.max(1.0)).clamp(0.0, 1.0);

            let components = ComponentScores {
                connection,
                latency,
                error_rate,
                reconnect,
            };
            let w = self.cfg.weights;
            let composite = w.connection * connection
                + w.latency * latency
                + w.error_rate * error_rate
                + w.reconnect * reconnect;

            let (normalized, recommendation) = if conn.connected {
                let normalized = 100.0 * (1.0 - composite);
                let recommendation = if normalized >= 80.0 {
                    Recommendation::Healthy
                } else if normalized >= 60.0 {
                    Recommendation::Caution
                } else if normalized >= 40.0 {
                    Recommendation::Degraded
                } else {
                    Recommendation::FailoverRecommended
                };
                (normalized, recommendation)
            } else {
                (0.0, Recommendation::Unavailable)
            };

            self.track_transition(&provider, composite);

            scores.push(DegradationScore {
                provider,
                composite,
                components,
                normalized,
                recommendation,
                evaluated_at: now,
            });
        }

        let mut last = self.last.write().expect("lock poisoned");
        for score in &scores {
            last.insert(score.provider.clone(), score.clone());
        }
        scores
    }

    fn track_transition(&self, provider: &ProviderKey, composite: f64) {
        let mut tracks = self.tracks.lock().expect("mutex poisoned");
        let track = tracks.entry(provider.clone()).or_default();
        if composite >= self.cfg.degradation_threshold {
            track.below_streak = 0;
            if !track.degraded {
                track.degraded = true;
                warn!(provider = %provider, composite, "provider degraded");
                let _ = self.events.send(DegradationEvent::Degraded {
                    provider: provider.clone(),
                    composite,
                });
            }
        } else if track.degraded {
            track.below_streak += 1;
            if track.below_streak >= 2 {
                track.degraded = false;
                track.below_streak = 0;
                info!(provider = %provider, "provider recovered");
                let _ = self.events.send(DegradationEvent::Recovered {
                    provider: provider.clone(),
                });
            }
        }
    }

    /// Latest evaluation per provider.
    #[must_use]
    pub fn latest(&self) -> Vec<DegradationScore> {
        let mut scores: Vec<DegradationScore> = self
            .last
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        scores.sort_by(|a, b| a.provider.cmp(&b.provider));
        scores
    }

    /// Pick the failover candidate with the highest normalized score at or
    /// above the failover threshold, skipping `exclude` and unavailable
    /// providers. `None` when nothing qualifies.
    #[must_use]
    pub fn select_best(
        &self,
        candidates: &[ProviderKey],
        exclude: Option<&ProviderKey>,
    ) -> Option<ProviderKey> {
        let last = self.last.read().expect("lock poisoned");
        candidates
            .iter()
            .filter(|c| exclude != Some(*c))
            .filter_map(|c| last.get(c))
            .filter(|s| s.recommendation != Recommendation::Unavailable)
            .filter(|s| s.normalized >= self.cfg.failover_threshold)
            .max_by(|a, b| {
                a.normalized
                    .partial_cmp(&b.normalized)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.provider.clone())
    }

    /// Spawn the periodic evaluator.
    pub fn spawn_evaluator(self: &Arc<Self>, health: Arc<HealthMonitor>) -> TaskHandle {
        let this = Arc::clone(self);
        TaskHandle::spawn(move |mut stop| async move {
            let mut ticker = tokio::time::interval(this.cfg.evaluation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        this.evaluate(&health);
                    }
                }
            }
        })
    }
}
