use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maintenance and backfill task types the job engine dispatches.
///
/// The engine routes these to registered task implementations; it does not
/// implement any of them itself. `FullMaintenance` is an ordered sequence of
/// the individual maintenance steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum TaskType {
    /// Probe archive and provider health.
    HealthCheck,
    /// Remove temp files and empty partitions.
    Cleanup,
    /// Rewrite fragmented partitions.
    Defragmentation,
    /// Move data between storage tiers by age.
    TierMigration,
    /// Re-compress partitions.
    Compression,
    /// Repair damaged partitions.
    Repair,
    /// Ordered sequence of the individual maintenance steps.
    FullMaintenance,
    /// Verify partition integrity.
    IntegrityCheck,
    /// Archive closed partitions.
    Archival,
    /// Enforce retention windows.
    RetentionEnforcement,
    /// Backfill detected gaps from a historical source.
    GapFill,
}

impl TaskType {
    /// Stable kebab-case identifier for logs and persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HealthCheck => "health-check",
            Self::Cleanup => "cleanup",
            Self::Defragmentation => "defragmentation",
            Self::TierMigration => "tier-migration",
            Self::Compression => "compression",
            Self::Repair => "repair",
            Self::FullMaintenance => "full-maintenance",
            Self::IntegrityCheck => "integrity-check",
            Self::Archival => "archival",
            Self::RetentionEnforcement => "retention-enforcement",
            Self::GapFill => "gap-fill",
        }
    }

    /// The ordered steps a full-maintenance run executes.
    pub const FULL_MAINTENANCE_STEPS: [Self; 7] = [
        Self::HealthCheck,
        Self::Cleanup,
        Self::Defragmentation,
        Self::Compression,
        Self::TierMigration,
        Self::IntegrityCheck,
        Self::RetentionEnforcement,
    ];

    /// Whether this task must not run while the market is open.
    #[must_use]
    pub const fn requires_market_closed(self) -> bool {
        matches!(self, Self::TierMigration | Self::Defragmentation)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution priority; `Critical` fires first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Jump the queue.
    Critical,
    /// Ahead of routine work.
    High,
    /// Routine.
    #[default]
    Normal,
    /// Behind routine work.
    Low,
    /// Only when nothing else is queued.
    Background,
}

/// Lifecycle status of an execution. Terminal statuses are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing the task.
    Running,
    /// Finished cleanly.
    Completed,
    /// Finished, but with warnings (e.g. a precondition gate declined).
    CompletedWithWarnings,
    /// Retries exhausted or a non-transient failure.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Exceeded its max duration.
    TimedOut,
}

impl ExecutionStatus {
    /// Whether the status is terminal (immutable once reached).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithWarnings
                | Self::Failed
                | Self::Cancelled
                | Self::TimedOut
        )
    }
}

/// A recurring schedule, durable across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Stable schedule id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// 5-field cron expression (minute hour dom month dow).
    pub cron_expression: String,
    /// IANA time-zone id the expression is evaluated in.
    pub time_zone: String,
    /// Task the schedule triggers.
    pub task_type: TaskType,
    /// Opaque options forwarded to the task.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Queue priority of triggered executions.
    #[serde(default)]
    pub priority: Priority,
    /// Whether the schedule fires at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hard wall-clock bound per execution.
    #[serde(default = "default_max_duration")]
    pub max_duration: Duration,
    /// Retries allowed per execution on transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Last time the schedule fired.
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Next computed fire time; `> now` whenever enabled.
    #[serde(default)]
    pub next_execution_at: Option<DateTime<Utc>>,
    /// Number of times the schedule has fired.
    #[serde(default)]
    pub execution_count: u64,
    /// Terminal status of the most recent execution.
    #[serde(default)]
    pub last_status: Option<ExecutionStatus>,
}

fn default_enabled() -> bool {
    true
}

const fn default_max_duration() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

const fn default_max_retries() -> u32 {
    2
}

impl CronSchedule {
    /// Build a schedule with defaults for the optional fields.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        time_zone: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            time_zone: time_zone.into(),
            task_type,
            options: serde_json::Value::Null,
            priority: Priority::default(),
            enabled: true,
            max_duration: default_max_duration(),
            max_retries: default_max_retries(),
            last_executed_at: None,
            next_execution_at: None,
            execution_count: 0,
            last_status: None,
        }
    }
}

/// Aggregate result a task reports back to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Files touched by the task.
    pub files_processed: u64,
    /// Issues the task detected.
    pub issues_found: u64,
    /// Issues the task resolved.
    pub issues_resolved: u64,
    /// Bytes read or rewritten.
    pub bytes_processed: u64,
    /// Bytes reclaimed.
    pub bytes_saved: u64,
    /// Warnings worth surfacing without failing the execution.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Log lines recorded during the run.
    #[serde(default)]
    pub log: Vec<String>,
    /// Task-specific structured result.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl TaskReport {
    /// Fold another report into this one (used by full-maintenance sequencing).
    pub fn absorb(&mut self, other: Self) {
        self.files_processed += other.files_processed;
        self.issues_found += other.issues_found;
        self.issues_resolved += other.issues_resolved;
        self.bytes_processed += other.bytes_processed;
        self.bytes_saved += other.bytes_saved;
        self.warnings.extend(other.warnings);
        self.log.extend(other.log);
    }
}

/// History entry for one execution; immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique execution id, also the idempotency/dedup key.
    pub id: String,
    /// Parent schedule, when triggered by one.
    pub schedule_id: Option<String>,
    /// Task being executed.
    pub task_type: TaskType,
    /// Queue priority.
    pub priority: Priority,
    /// Current status.
    pub status: ExecutionStatus,
    /// Options forwarded to the task.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Hard wall-clock bound.
    pub max_duration: Duration,
    /// Retries allowed on transient failure.
    pub max_retries: u32,
    /// Retry attempt this entry is on (0 = first try).
    #[serde(default)]
    pub attempt: u32,
    /// When the execution was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When a worker picked it up.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error from the final attempt, when failed/timed out.
    #[serde(default)]
    pub error: Option<String>,
    /// Aggregate result of the run.
    #[serde(default)]
    pub report: TaskReport,
}

impl Execution {
    /// Build a pending execution.
    pub fn new(
        id: impl Into<String>,
        schedule_id: Option<String>,
        task_type: TaskType,
        priority: Priority,
        options: serde_json::Value,
        max_duration: Duration,
        max_retries: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            schedule_id,
            task_type,
            priority,
            status: ExecutionStatus::Pending,
            options,
            max_duration,
            max_retries,
            attempt: 0,
            enqueued_at,
            started_at: None,
            completed_at: None,
            error: None,
            report: TaskReport::default(),
        }
    }
}
