use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Functional area an alert belongs to; one half of the batch group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum AlertCategory {
    /// Provider connections and heartbeats.
    Connection,
    /// Tick-size, divergence, gaps, ordering.
    DataQuality,
    /// Archive writes and persistence.
    Storage,
    /// Schedules and job executions.
    Scheduler,
    /// Pipeline depth and drops.
    Pipeline,
    /// Everything else.
    System,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::DataQuality => "data-quality",
            Self::Storage => "storage",
            Self::Scheduler => "scheduler",
            Self::Pipeline => "pipeline",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Alert severity; ordered so `Critical` is greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention eventually.
    Warning,
    /// Needs attention now.
    Error,
    /// Service-level problem.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single alert as submitted to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertItem {
    /// Functional area.
    pub category: AlertCategory,
    /// Severity.
    pub severity: AlertSeverity,
    /// Short title.
    pub title: String,
    /// Full message.
    pub message: String,
    /// Component that raised the alert.
    pub source: String,
    /// Explicit dedup fingerprint; derived from category/title/source when absent.
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl AlertItem {
    /// The dedup key: the explicit fingerprint, or `category:title:source`.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        self.fingerprint.clone().unwrap_or_else(|| {
            format!("{}:{}:{}", self.category, self.title, self.source)
        })
    }
}

/// A flushed batch of alerts sharing (category, severity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertBatch {
    /// Group category.
    pub category: AlertCategory,
    /// Group severity.
    pub severity: AlertSeverity,
    /// Number of alerts in the batch.
    pub count: usize,
    /// Highest severity across the items (equals the group severity today,
    /// kept separate so grouping can coarsen later).
    pub max_severity: AlertSeverity,
    /// Per-source item counts.
    pub by_source: BTreeMap<String, usize>,
    /// The full alert list.
    pub items: Vec<AlertItem>,
    /// When the batch left the aggregator.
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_critical_greatest() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Error < AlertSeverity::Critical);
    }

    #[test]
    fn dedup_key_derives_when_absent() {
        let item = AlertItem {
            category: AlertCategory::DataQuality,
            severity: AlertSeverity::Warning,
            title: "tick-size violation".into(),
            message: "AAPL 185.255".into(),
            source: "tick-size".into(),
            fingerprint: None,
            timestamp: Utc::now(),
        };
        assert_eq!(item.dedup_key(), "data-quality:tick-size violation:tick-size");
    }
}
