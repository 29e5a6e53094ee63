//! The abstract provider contract and the task-dispatch contract.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use tickvault_types::{
    Channel, MarketEvent, ProviderKey, SymbolSpec, TaskReport, TaskType, VaultError,
};

/// Non-blocking publish surface handed to providers at registration.
///
/// Provider callbacks run on provider-owned tasks and MUST NOT block; the
/// only way into the engine is this try-publish, which returns `false` when
/// the pipeline is full or shut down. Rejections are accounted, not retried.
pub trait EventSink: Send + Sync {
    /// Offer one event to the pipeline. Never blocks.
    fn try_publish(&self, event: MarketEvent) -> bool;
}

/// Optional idle probe a provider can expose for heartbeat keep-alive.
#[async_trait]
pub trait PingSender: Send + Sync {
    /// Send a lightweight probe on the provider channel.
    async fn ping(&self) -> Result<(), VaultError>;
}

/// Contract every market-data provider implements.
///
/// Subscribe calls return the provider-assigned id (`>= 1`); failures are
/// reported through `Err`, and the orchestrator records the failed sentinel
/// and retries on the next apply. Unsubscribe calls are idempotent and
/// best-effort.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Stable key identifying this provider in maps and events.
    fn key(&self) -> ProviderKey;

    /// Short human-readable name.
    fn name(&self) -> &'static str;

    /// Whether the provider should be used at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the provider serves the given channel.
    fn supports(&self, channel: Channel) -> bool;

    /// Attach the engine sink. Called once at registration, before any
    /// subscribe call; the provider pushes every event through it.
    fn attach(&self, sink: Arc<dyn EventSink>);

    /// Subscribe to tick-level trades for an equity spec.
    async fn subscribe_trades(&self, spec: &SymbolSpec) -> Result<i64, VaultError>;

    /// Subscribe to level-2 depth (equities only).
    async fn subscribe_depth(&self, spec: &SymbolSpec) -> Result<i64, VaultError>;

    /// Subscribe to option trades.
    async fn subscribe_option_trades(&self, spec: &SymbolSpec) -> Result<i64, VaultError>;

    /// Drop a trades subscription. Idempotent, best-effort.
    async fn unsubscribe_trades(&self, id: i64) -> Result<(), VaultError>;

    /// Drop a depth subscription. Idempotent, best-effort.
    async fn unsubscribe_depth(&self, id: i64) -> Result<(), VaultError>;

    /// Drop an option-trades subscription. Idempotent, best-effort.
    async fn unsubscribe_option_trades(&self, id: i64) -> Result<(), VaultError>;

    /// Optional idle probe used when a channel has been quiet for half a
    /// heartbeat interval.
    fn as_ping_sender(&self) -> Option<&dyn PingSender> {
        None
    }
}

/// Everything a task run gets from the engine.
pub struct TaskContext {
    /// The execution id, usable as an idempotency key by the task.
    pub execution_id: String,
    /// Which task type is being dispatched.
    pub task: TaskType,
    /// Options blob from the schedule.
    pub options: serde_json::Value,
    /// Cooperative cancel signal; flips to `true` when the run should stop.
    pub cancel: watch::Receiver<bool>,
}

impl TaskContext {
    /// Whether cancellation has been requested.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// A maintenance or backfill task the job engine can dispatch.
///
/// Implementations must be idempotent per the options provided: the engine
/// re-runs pending executions found after a restart, and retries transient
/// failures with the same execution id.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    /// Run the task to completion or until `ctx.cancel` fires.
    async fn run(&self, ctx: TaskContext) -> Result<TaskReport, VaultError>;

    /// Whether the task observes `ctx.cancel`. Tasks that do not are left to
    /// run out their max duration when cancelled.
    fn cancellable(&self) -> bool {
        true
    }
}
