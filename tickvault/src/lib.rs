//! tickvault collects live tick-level market data and archives it.
//!
//! Overview
//! - Ingests trades, quotes, depth, and bars from registered providers
//!   through a bounded, non-blocking pipeline with drop accounting.
//! - Reconciles a desired symbol set against live provider subscriptions,
//!   with per-call timeouts and failed-subscribe retry.
//! - Drives recurring maintenance and backfill through a time-zone-aware
//!   cron scheduler and a prioritized, retrying job engine.
//! - Scores provider quality (connection, latency, errors, reconnects) and
//!   recommends failover; aggregates alerts with dedup and batching.
//! - Binds every stage together with reconciliation counters so silent data
//!   loss shows up as a nonzero residual instead of a mystery.
//!
//! Key behaviors and trade-offs
//! - Publishes never block a provider callback: the pipeline rejects when
//!   full and counts the drop. Durability belongs upstream of the queue.
//! - The archive sink is not retried; failures count as `store_failed`.
//! - One consumer task serializes archive writes (single writer per
//!   partition), so ordering per (symbol, kind) follows publish order.
//! - Degradation evaluation is snapshot-based: slightly stale, never torn.
#![warn(missing_docs)]

mod alerts;
mod archive;
mod coordinator;
pub(crate) mod core;
mod health;
mod jobs;
mod orchestrator;
mod persist;
mod pipeline;
mod recon;
mod sched;
mod status;
mod validate;

pub use crate::core::{Collector, CollectorBuilder};
pub use alerts::AlertAggregator;
pub use archive::JsonlArchive;
pub use coordinator::{FileLockCoordinator, SoloCoordinator};
pub use health::degradation::{DegradationEvent, DegradationScorer};
pub use health::skew::SkewEstimator;
pub use health::{ConnectionEvent, HealthMonitor};
pub use jobs::{ExecutionEvent, JobEngine};
pub use orchestrator::{ApplyOutcome, Orchestrator};
pub use pipeline::{EventPipeline, PipelineStats};
pub use recon::Counters;
pub use sched::Scheduler;
pub use sched::cron::CronExpression;

// Re-export contracts and domain types for convenience
pub use tickvault_core::{
    ActiveSubscription,
    AlertBatch,
    AlertCategory,
    AlertItem,
    AlertSeverity,
    ArchiveWriter,
    Bar,
    BboQuote,
    Channel,
    Claim,
    CollectorConfig,
    ConnectionSnapshot,
    CronSchedule,
    DegradationScore,
    EventKind,
    EventPayload,
    EventSink,
    Execution,
    ExecutionStatus,
    InstanceCoordinator,
    Integrity,
    IntegrityKind,
    MaintenanceTask,
    MarketDataProvider,
    MarketEvent,
    PipelineSnapshot,
    Priority,
    ProviderKey,
    Recommendation,
    ReconciliationSnapshot,
    StatusReport,
    Symbol,
    SymbolSpec,
    TaskContext,
    TaskHandle,
    TaskReport,
    TaskType,
    Trade,
    VaultError,
};
