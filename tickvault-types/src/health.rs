//! Read-only report envelopes assembled by the status snapshotter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ProviderKey;

/// Latency digest for one provider channel, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Running minimum.
    pub min_ms: f64,
    /// Running maximum.
    pub max_ms: f64,
    /// Running mean over the connection lifetime.
    pub mean_ms: f64,
    /// Exponentially weighted recent latency.
    pub ewma_ms: f64,
    /// 95th percentile over the bounded recent window.
    pub p95_ms: f64,
}

/// Point-in-time view of one provider connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Provider the channel belongs to.
    pub provider: ProviderKey,
    /// Whether the channel is currently considered connected.
    pub connected: bool,
    /// Last time any data or heartbeat arrived.
    pub last_activity: Option<DateTime<Utc>>,
    /// Consecutive missed heartbeat checks.
    pub missed_heartbeats: u32,
    /// Times the channel reconnected.
    pub reconnect_count: u64,
    /// Total events observed on the channel.
    pub total_events: u64,
    /// When the current connected stretch began.
    pub uptime_start: Option<DateTime<Utc>>,
    /// Latency digest.
    pub latency: LatencySnapshot,
}

/// Per-component degradation scores, each in [0, 1] (0 = healthy).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    /// Disconnection / missed-heartbeat pressure.
    pub connection: f64,
    /// p95 latency pressure.
    pub latency: f64,
    /// Windowed failure-rate pressure.
    pub error_rate: f64,
    /// Reconnects-per-hour pressure.
    pub reconnect: f64,
}

/// Tiered failover recommendation derived from the normalized score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    /// Normalized score >= 80.
    Healthy,
    /// Normalized score >= 60.
    Caution,
    /// Normalized score >= 40.
    Degraded,
    /// Normalized score below 40.
    FailoverRecommended,
    /// Channel is disconnected.
    Unavailable,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Caution => "caution",
            Self::Degraded => "degraded",
            Self::FailoverRecommended => "failover-recommended",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// One provider's degradation evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationScore {
    /// Scored provider.
    pub provider: ProviderKey,
    /// Weighted composite in [0, 1]; 0 healthy, 1 fully degraded.
    pub composite: f64,
    /// Component breakdown.
    pub components: ComponentScores,
    /// 0-100 form used for failover selection (100 = perfectly healthy).
    pub normalized: f64,
    /// Tiered recommendation.
    pub recommendation: Recommendation,
    /// When the evaluation ran.
    pub evaluated_at: DateTime<Utc>,
}

/// Snapshot of the stage-linking reconciliation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSnapshot {
    /// Events handed to the engine by providers.
    pub received: u64,
    /// Events dropped as duplicates of an already-seen sequence.
    pub received_duplicates: u64,
    /// Events that passed sanity validation.
    pub validated: u64,
    /// Events rejected by sanity validation.
    pub rejected: u64,
    /// Events accepted into the pipeline queue.
    pub pipeline_accepted: u64,
    /// Events refused because the queue was full or closed.
    pub pipeline_dropped: u64,
    /// Events acknowledged by the archive sink.
    pub stored: u64,
    /// Events the sink failed to store (including drain-abandoned ones).
    pub store_failed: u64,
    /// Loss acknowledged by an invariant-violation path.
    pub unaccounted: u64,
}

impl ReconciliationSnapshot {
    /// The reconciliation residual:
    /// `received - (duplicates + rejected + dropped + store_failed + stored + unaccounted)`.
    ///
    /// Zero at any quiescent point; transiently positive while events are in
    /// flight between stages.
    #[must_use]
    pub fn residual(&self) -> i64 {
        let accounted = self.received_duplicates
            + self.rejected
            + self.pipeline_dropped
            + self.store_failed
            + self.stored
            + self.unaccounted;
        self.received as i64 - accounted as i64
    }
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    /// Events offered to the pipeline (accepted + dropped).
    pub published: u64,
    /// Events refused because the queue was full or closed.
    pub dropped: u64,
    /// Offered-event tallies keyed by event kind.
    pub per_kind: BTreeMap<String, u64>,
    /// Items queued right now.
    pub current_depth: u64,
    /// Highest depth observed.
    pub peak_depth: u64,
    /// EWMA of accepted events per second over 1 s buckets.
    pub published_per_sec: f64,
    /// Events acknowledged by the sink.
    pub stored: u64,
    /// Events the sink failed to store.
    pub store_failed: u64,
}

/// Subscription tallies per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCounts {
    /// Live trade subscriptions.
    pub trades: usize,
    /// Live depth subscriptions.
    pub depth: usize,
    /// Live option-trade subscriptions.
    pub option_trades: usize,
    /// Rows carrying the failed sentinel, pending retry.
    pub failed: usize,
}

/// The aggregated read-only status view.
///
/// Values are snapshot-based: they may be up to one evaluation interval
/// stale, but are never torn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Stage-linking counters.
    pub reconciliation: ReconciliationSnapshot,
    /// Pipeline counters.
    pub pipeline: PipelineSnapshot,
    /// Per-connection health.
    pub connections: Vec<ConnectionSnapshot>,
    /// Latest degradation evaluation per provider.
    pub degradation: Vec<DegradationScore>,
    /// EWMA clock skew per provider, milliseconds.
    pub clock_skew_ms: BTreeMap<String, f64>,
    /// Subscription tallies.
    pub subscriptions: SubscriptionCounts,
    /// When the report was assembled.
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_is_zero_when_fully_accounted() {
        let snap = ReconciliationSnapshot {
            received: 10,
            received_duplicates: 1,
            rejected: 1,
            pipeline_dropped: 2,
            store_failed: 1,
            stored: 5,
            unaccounted: 0,
            validated: 8,
            pipeline_accepted: 8,
        };
        assert_eq!(snap.residual(), 0);
    }

    #[test]
    fn residual_flags_inflight_loss() {
        let snap = ReconciliationSnapshot {
            received: 10,
            stored: 5,
            ..ReconciliationSnapshot::default()
        };
        assert_eq!(snap.residual(), 5);
    }
}
