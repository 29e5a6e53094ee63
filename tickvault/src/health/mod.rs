//! Per-connection health: activity tracking, latency digests, heartbeat
//! supervision, and typed transition events.

pub(crate) mod degradation;
pub(crate) mod skew;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use tickvault_core::TaskHandle;
use tickvault_core::provider::PingSender;
use tickvault_types::{ConnectionSnapshot, HealthConfig, LatencySnapshot, ProviderKey};

use degradation::DegradationScorer;

/// Typed health transition, published on a broadcast channel.
///
/// Subscribers are tasks reading from the channel; there is no reentrant
/// handler callback path.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A heartbeat check found the channel silent past the timeout.
    HeartbeatMissed {
        /// Affected provider.
        provider: ProviderKey,
        /// Consecutive misses so far.
        missed: u32,
    },
    /// Missed heartbeats reached the limit; the channel is now disconnected.
    Disconnected {
        /// Affected provider.
        provider: ProviderKey,
    },
    /// The channel (re)connected.
    Connected {
        /// Affected provider.
        provider: ProviderKey,
    },
}

struct LatencyStats {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
    ewma: f64,
    recent: VecDeque<f64>,
}

impl LatencyStats {
    const fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: 0.0,
            sum: 0.0,
            count: 0,
            ewma: 0.0,
            recent: VecDeque::new(),
        }
    }

    fn record(&mut self, ms: f64, alpha: f64, window: usize) {
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);
        self.sum += ms;
        self.ewma = if self.count == 0 {
            ms
        } else {
            alpha * ms + (1.0 - alpha) * self.ewma
        };
        self.count += 1;
        self.recent.push_back(ms);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }

    fn p95(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            min_ms: if self.count == 0 { 0.0 } else { self.min },
            max_ms: self.max,
            mean_ms: if self.count == 0 {
                0.0
            } else {
                self.sum / self.count as f64
            },
            ewma_ms: self.ewma,
            p95_ms: self.p95(),
        }
    }
}

struct ConnState {
    connected: bool,
    ever_connected: bool,
    last_activity: Option<Instant>,
    last_activity_wall: Option<DateTime<Utc>>,
    missed_heartbeats: u32,
    uptime_start: Option<DateTime<Utc>>,
    latency: LatencyStats,
    reconnect_times: VecDeque<Instant>,
}

/// One provider channel's health state: per-connection lock, atomic counters.
pub struct ConnectionHealth {
    provider: ProviderKey,
    state: Mutex<ConnState>,
    reconnect_count: AtomicU64,
    total_events: AtomicU64,
}

impl ConnectionHealth {
    fn new(provider: ProviderKey) -> Self {
        Self {
            provider,
            state: Mutex::new(ConnState {
                connected: false,
                ever_connected: false,
                last_activity: None,
                last_activity_wall: None,
                missed_heartbeats: 0,
                uptime_start: None,
                latency: LatencyStats::new(),
                reconnect_times: VecDeque::new(),
            }),
            reconnect_count: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
        }
    }
}

/// Registry of connection health plus the heartbeat supervisor.
pub struct HealthMonitor {
    cfg: HealthConfig,
    conns: RwLock<HashMap<ProviderKey, Arc<ConnectionHealth>>>,
    pingers: Mutex<HashMap<ProviderKey, Arc<dyn PingSender>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl HealthMonitor {
    /// Build an empty monitor.
    #[must_use]
    pub fn new(cfg: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            cfg,
            conns: RwLock::new(HashMap::new()),
            pingers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to connection transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register a provider channel, optionally with an idle probe.
    pub fn register(&self, provider: ProviderKey, pinger: Option<Arc<dyn PingSender>>) {
        self.conns
            .write()
            .expect("lock poisoned")
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(ConnectionHealth::new(provider.clone())));
        if let Some(p) = pinger {
            self.pingers.lock().expect("mutex poisoned").insert(provider, p);
        }
    }

    fn conn(&self, provider: &ProviderKey) -> Option<Arc<ConnectionHealth>> {
        self.conns
            .read()
            .expect("lock poisoned")
            .get(provider)
            .cloned()
    }

    /// Note data arrival on a channel. Reconnects a disconnected channel.
    pub fn record_event(&self, provider: &ProviderKey) {
        let Some(conn) = self.conn(provider) else {
            return;
        };
        conn.total_events.fetch_add(1, Ordering::Relaxed);
        let mut state = conn.state.lock().expect("mutex poisoned");
        state.last_activity = Some(Instant::now());
        state.last_activity_wall = Some(Utc::now());
        state.missed_heartbeats = 0;
        if !state.connected {
            self.transition_connected(&conn, &mut state);
        }
    }

    /// Record one latency sample (milliseconds) for a channel.
    pub fn record_latency(&self, provider: &ProviderKey, ms: f64) {
        let Some(conn) = self.conn(provider) else {
            return;
        };
        let mut state = conn.state.lock().expect("mutex poisoned");
        state
            .latency
            .record(ms, self.cfg.latency_ewma_alpha, self.cfg.latency_window);
    }

    /// Mark a channel connected (initial connect or explicit reconnect).
    pub fn mark_connected(&self, provider: &ProviderKey) {
        let Some(conn) = self.conn(provider) else {
            return;
        };
        let mut state = conn.state.lock().expect("mutex poisoned");
        if !state.connected {
            self.transition_connected(&conn, &mut state);
        }
    }

    /// Mark a channel disconnected (provider-reported drop).
    pub fn mark_disconnected(&self, provider: &ProviderKey) {
        let Some(conn) = self.conn(provider) else {
            return;
        };
        let mut state = conn.state.lock().expect("mutex poisoned");
        if state.connected {
            state.connected = false;
            state.uptime_start = None;
            let _ = self.events.send(ConnectionEvent::Disconnected {
                provider: conn.provider.clone(),
            });
        }
    }

    fn transition_connected(&self, conn: &Arc<ConnectionHealth>, state: &mut ConnState) {
        state.connected = true;
        state.missed_heartbeats = 0;
        state.uptime_start = Some(Utc::now());
        if state.ever_connected {
            conn.reconnect_count.fetch_add(1, Ordering::Relaxed);
            state.reconnect_times.push_back(Instant::now());
        } else {
            state.ever_connected = true;
        }
        let _ = self.events.send(ConnectionEvent::Connected {
            provider: conn.provider.clone(),
        });
    }

    /// Whether a channel is currently connected.
    #[must_use]
    pub fn is_connected(&self, provider: &ProviderKey) -> bool {
        self.conn(provider)
            .map(|c| c.state.lock().expect("mutex poisoned").connected)
            .unwrap_or(false)
    }

    /// Reconnects observed in the trailing hour.
    #[must_use]
    pub fn reconnects_last_hour(&self, provider: &ProviderKey) -> f64 {
        let Some(conn) = self.conn(provider) else {
            return 0.0;
        };
        let mut state = conn.state.lock().expect("mutex poisoned");
        let now = Instant::now();
        while let Some(front) = state.reconnect_times.front() {
            if now.duration_since(*front) > std::time::Duration::from_secs(3600) {
                state.reconnect_times.pop_front();
            } else {
                break;
            }
        }
        state.reconnect_times.len() as f64
    }

    /// Missed heartbeats on a channel right now.
    #[must_use]
    pub fn missed_heartbeats(&self, provider: &ProviderKey) -> u32 {
        self.conn(provider)
            .map(|c| c.state.lock().expect("mutex poisoned").missed_heartbeats)
            .unwrap_or(0)
    }

    /// Snapshot every registered channel.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let conns: Vec<Arc<ConnectionHealth>> = self
            .conns
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut out: Vec<ConnectionSnapshot> = conns
            .iter()
            .map(|conn| {
                let state = conn.state.lock().expect("mutex poisoned");
                ConnectionSnapshot {
                    provider: conn.provider.clone(),
                    connected: state.connected,
                    last_activity: state.last_activity_wall,
                    missed_heartbeats: state.missed_heartbeats,
                    reconnect_count: conn.reconnect_count.load(Ordering::Relaxed),
                    total_events: conn.total_events.load(Ordering::Relaxed),
                    uptime_start: state.uptime_start,
                    latency: state.latency.snapshot(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Run one heartbeat sweep; factored out of the timer for tests.
    pub fn heartbeat_sweep(&self, scorer: Option<&DegradationScorer>) {
        let conns: Vec<Arc<ConnectionHealth>> = self
            .conns
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        let now = Instant::now();
        for conn in conns {
            let mut state = conn.state.lock().expect("mutex poisoned");
            if !state.connected {
                continue;
            }
            let idle = state
                .last_activity
                .map(|t| now.duration_since(t))
                .unwrap_or(self.cfg.heartbeat_timeout);
            if idle >= self.cfg.heartbeat_timeout {
                state.missed_heartbeats += 1;
                let missed = state.missed_heartbeats;
                warn!(provider = %conn.provider, missed, "heartbeat missed");
                let _ = self.events.send(ConnectionEvent::HeartbeatMissed {
                    provider: conn.provider.clone(),
                    missed,
                });
                if let Some(s) = scorer {
                    s.record_outcome(&conn.provider, false);
                }
                if missed >= self.cfg.max_missed_heartbeats {
                    state.connected = false;
                    state.uptime_start = None;
                    let _ = self.events.send(ConnectionEvent::Disconnected {
                        provider: conn.provider.clone(),
                    });
                }
            } else if idle >= self.cfg.heartbeat_interval / 2 {
                // Quiet but not yet overdue: probe if the provider offers one.
                let pinger = self
                    .pingers
                    .lock()
                    .expect("mutex poisoned")
                    .get(&conn.provider)
                    .cloned();
                if let Some(pinger) = pinger {
                    debug!(provider = %conn.provider, "sending idle probe");
                    tokio::spawn(async move {
                        let _ = pinger.ping().await;
                    });
                }
            }
        }
    }

    /// Spawn the heartbeat supervisor timer.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        scorer: Option<Arc<DegradationScorer>>,
    ) -> TaskHandle {
        let this = Arc::clone(self);
        TaskHandle::spawn(move |mut stop| async move {
            let mut ticker = tokio::time::interval(this.cfg.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start is
            // not counted as silence.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => this.heartbeat_sweep(scorer.as_deref()),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            latency_ewma_alpha: 0.2,
            latency_window: 8,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_counts_misses_and_disconnects() {
        let m = monitor();
        let p = ProviderKey::new("p");
        m.register(p.clone(), None);
        m.mark_connected(&p);
        m.record_event(&p);

        tokio::time::advance(Duration::from_secs(61)).await;
        m.heartbeat_sweep(None);
        assert_eq!(m.missed_heartbeats(&p), 1);
        assert!(m.is_connected(&p));

        tokio::time::advance(Duration::from_secs(61)).await;
        m.heartbeat_sweep(None);
        tokio::time::advance(Duration::from_secs(61)).await;
        m.heartbeat_sweep(None);
        assert!(!m.is_connected(&p));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_misses_and_reconnects() {
        let m = monitor();
        let p = ProviderKey::new("p");
        m.register(p.clone(), None);
        m.mark_connected(&p);
        tokio::time::advance(Duration::from_secs(61)).await;
        m.heartbeat_sweep(None);
        assert_eq!(m.missed_heartbeats(&p), 1);

        m.record_event(&p);
        assert_eq!(m.missed_heartbeats(&p), 0);

        // Force a disconnect, then data arrival auto-reconnects.
        m.mark_disconnected(&p);
        assert!(!m.is_connected(&p));
        m.record_event(&p);
        assert!(m.is_connected(&p));
        assert_eq!(m.reconnects_last_hour(&p), 1.0);
    }

    #[tokio::test]
    async fn latency_digest_tracks_p95() {
        let m = monitor();
        let p = ProviderKey::new("p");
        m.register(p.clone(), None);
        for ms in [10.0, 20.0, 30.0, 40.0, 1000.0] {
            m.record_latency(&p, ms);
        }
        let snap = m.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].latency.min_ms, 10.0);
        assert_eq!(snap[0].latency.max_ms, 1000.0);
        assert_eq!(snap[0].latency.p95_ms, 1000.0);
    }
}
