//! Read-only status aggregation across the engine's counters and monitors.

use chrono::Utc;

use tickvault_types::{StatusReport, SubscriptionCounts};

use crate::health::HealthMonitor;
use crate::health::degradation::DegradationScorer;
use crate::health::skew::SkewEstimator;
use crate::pipeline::PipelineStats;
use crate::recon::Counters;

/// Assemble a [`StatusReport`] from the live components.
///
/// Every input is snapshot-based; the report is internally consistent per
/// field but fields may be up to one evaluation interval apart.
pub(crate) fn build_report(
    counters: &Counters,
    pipeline: &PipelineStats,
    health: &HealthMonitor,
    scorer: &DegradationScorer,
    skew: &SkewEstimator,
    subscriptions: SubscriptionCounts,
) -> StatusReport {
    StatusReport {
        reconciliation: counters.snapshot(),
        pipeline: pipeline.snapshot(),
        connections: health.snapshot(),
        degradation: scorer.latest(),
        clock_skew_ms: skew.snapshot(),
        subscriptions,
        generated_at: Utc::now(),
    }
}
