//! Domain model and configuration primitives for the tickvault collection engine.
#![warn(missing_docs)]

mod alert;
mod config;
mod error;
mod event;
mod health;
mod schedule;
mod subscription;
mod symbol;

pub use alert::{AlertBatch, AlertCategory, AlertItem, AlertSeverity};
pub use config::{
    AlertConfig, CollectorConfig, CoordinatorConfig, CoordinatorMode, DegradationConfig,
    DegradationWeights, HealthConfig, PipelineConfig, SchedulerConfig, ValidatorConfig,
    env_overrides_help,
};
pub use error::VaultError;
pub use event::{
    Bar, BboQuote, BookSide, DepthOp, DepthUpdate, EventKind, EventPayload, Integrity,
    IntegrityKind, MarketEvent, ProviderKey, Trade,
};
pub use health::{
    ComponentScores, ConnectionSnapshot, DegradationScore, LatencySnapshot, PipelineSnapshot,
    Recommendation, ReconciliationSnapshot, StatusReport, SubscriptionCounts,
};
pub use schedule::{
    CronSchedule, Execution, ExecutionStatus, Priority, TaskReport, TaskType,
};
pub use subscription::{ActiveSubscription, Channel, SubscriptionState};
pub use symbol::{OptionRight, OptionTerms, SecurityType, Symbol, SymbolSpec};
