//! Mock provider and archive for engine tests.
//!
//! `MockProvider` records every call it receives so orchestrator tests can
//! assert on the exact subscribe/unsubscribe sequence, and exposes per-channel
//! failure switches plus a `push_*` surface for injecting events through the
//! attached sink. `MockArchive` collects stored events in memory with optional
//! per-write latency and failure injection for pipeline tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Mutex;

use tickvault_core::provider::{EventSink, MarketDataProvider};
use tickvault_core::{ArchiveWriter, MaintenanceTask, TaskContext};
use tickvault_core::{
    BboQuote, Channel, EventPayload, MarketEvent, ProviderKey, Symbol, SymbolSpec, TaskReport,
    Trade, VaultError,
};

/// One recorded provider call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    /// `subscribe_trades(symbol)`
    SubscribeTrades(Symbol),
    /// `subscribe_depth(symbol, depth_levels)`
    SubscribeDepth(Symbol, u32),
    /// `subscribe_option_trades(symbol)`
    SubscribeOptionTrades(Symbol),
    /// `unsubscribe_trades(id)`
    UnsubscribeTrades(i64),
    /// `unsubscribe_depth(id)`
    UnsubscribeDepth(i64),
    /// `unsubscribe_option_trades(id)`
    UnsubscribeOptionTrades(i64),
}

/// Scriptable in-memory provider.
pub struct MockProvider {
    name: &'static str,
    enabled: bool,
    next_id: AtomicI64,
    fail_trades: AtomicBool,
    fail_depth: AtomicBool,
    fail_options: AtomicBool,
    subscribe_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ProviderCall>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    seq: AtomicU64,
    event_id: AtomicU64,
}

impl MockProvider {
    /// Build a provider with the given key/name.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: true,
            next_id: AtomicI64::new(1),
            fail_trades: AtomicBool::new(false),
            fail_depth: AtomicBool::new(false),
            fail_options: AtomicBool::new(false),
            subscribe_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            seq: AtomicU64::new(1),
            event_id: AtomicU64::new(1),
        }
    }

    /// Flip the failure switch for one channel.
    pub fn set_fail(&self, channel: Channel, fail: bool) {
        let flag = match channel {
            Channel::Trades => &self.fail_trades,
            Channel::Depth => &self.fail_depth,
            Channel::OptionTrades => &self.fail_options,
        };
        flag.store(fail, Ordering::SeqCst);
    }

    /// Delay every subscribe call (to exercise the per-call timeout).
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        *self.subscribe_delay.lock().expect("mutex poisoned") = delay;
    }

    /// Everything the provider was asked to do, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().expect("mutex poisoned").clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().expect("mutex poisoned").clear();
    }

    /// Push a fully-formed event through the attached sink.
    ///
    /// Returns `false` when no sink is attached or the pipeline refused it.
    pub fn push_event(&self, event: MarketEvent) -> bool {
        let sink = self.sink.lock().expect("mutex poisoned").clone();
        sink.is_some_and(|s| s.try_publish(event))
    }

    /// Push a trade with engine-side timestamps and the next sequence number.
    pub fn push_trade(&self, symbol: impl AsRef<str>, price: Decimal, size: u64) -> bool {
        let now = Utc::now();
        self.push_event(MarketEvent {
            event_id: self.event_id.fetch_add(1, Ordering::Relaxed),
            symbol: Symbol::new(symbol),
            exchange_ts: now,
            received_at: now,
            provider: self.key(),
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
            payload: EventPayload::Trade(Trade { price, size }),
        })
    }

    /// Push a BBO quote with engine-side timestamps.
    pub fn push_quote(&self, symbol: impl AsRef<str>, bid: Decimal, ask: Decimal) -> bool {
        let now = Utc::now();
        self.push_event(MarketEvent {
            event_id: self.event_id.fetch_add(1, Ordering::Relaxed),
            symbol: Symbol::new(symbol),
            exchange_ts: now,
            received_at: now,
            provider: self.key(),
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
            payload: EventPayload::BboQuote(BboQuote {
                bid,
                bid_size: 100,
                ask,
                ask_size: 100,
            }),
        })
    }

    async fn subscribe(
        &self,
        call: ProviderCall,
        fail: &AtomicBool,
        channel: Channel,
    ) -> Result<i64, VaultError> {
        let delay = *self.subscribe_delay.lock().expect("mutex poisoned");
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.calls.lock().expect("mutex poisoned").push(call);
        if fail.load(Ordering::SeqCst) {
            return Err(VaultError::provider(
                self.name,
                format!("forced {channel} subscribe failure"),
            ));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    fn key(&self) -> ProviderKey {
        ProviderKey::new(self.name)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn supports(&self, _channel: Channel) -> bool {
        true
    }

    fn attach(&self, sink: Arc<dyn EventSink>) {
        *self.sink.lock().expect("mutex poisoned") = Some(sink);
    }

    async fn subscribe_trades(&self, spec: &SymbolSpec) -> Result<i64, VaultError> {
        self.subscribe(
            ProviderCall::SubscribeTrades(spec.symbol.clone()),
            &self.fail_trades,
            Channel::Trades,
        )
        .await
    }

    async fn subscribe_depth(&self, spec: &SymbolSpec) -> Result<i64, VaultError> {
        self.subscribe(
            ProviderCall::SubscribeDepth(spec.symbol.clone(), spec.depth_levels),
            &self.fail_depth,
            Channel::Depth,
        )
        .await
    }

    async fn subscribe_option_trades(&self, spec: &SymbolSpec) -> Result<i64, VaultError> {
        self.subscribe(
            ProviderCall::SubscribeOptionTrades(spec.symbol.clone()),
            &self.fail_options,
            Channel::OptionTrades,
        )
        .await
    }

    async fn unsubscribe_trades(&self, id: i64) -> Result<(), VaultError> {
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push(ProviderCall::UnsubscribeTrades(id));
        Ok(())
    }

    async fn unsubscribe_depth(&self, id: i64) -> Result<(), VaultError> {
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push(ProviderCall::UnsubscribeDepth(id));
        Ok(())
    }

    async fn unsubscribe_option_trades(&self, id: i64) -> Result<(), VaultError> {
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push(ProviderCall::UnsubscribeOptionTrades(id));
        Ok(())
    }
}

/// In-memory archive with optional latency and failure injection.
pub struct MockArchive {
    stored: Mutex<Vec<MarketEvent>>,
    write_delay: Mutex<Option<Duration>>,
    fail_all: AtomicBool,
    flushes: AtomicU64,
    closed: AtomicBool,
}

impl Default for MockArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl MockArchive {
    /// Empty archive accepting every write.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(Vec::new()),
            write_delay: Mutex::new(None),
            fail_all: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every write take this long (slow-consumer simulation).
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().expect("mutex poisoned") = delay;
    }

    /// Make every write fail.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Everything stored so far.
    #[must_use]
    pub fn stored(&self) -> Vec<MarketEvent> {
        self.stored.lock().expect("mutex poisoned").clone()
    }

    /// How many flushes were requested.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Whether `close` has run.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveWriter for MockArchive {
    async fn write(&self, event: &MarketEvent) -> Result<(), VaultError> {
        let delay = *self.write_delay.lock().expect("mutex poisoned");
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(VaultError::storage("forced archive failure"));
        }
        self.stored
            .lock()
            .expect("mutex poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), VaultError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), VaultError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted outcome for one [`ScriptedTask`] run.
#[derive(Debug, Clone)]
pub enum TaskStep {
    /// Complete with the given report.
    Succeed(TaskReport),
    /// Fail with a transient error (retried by the engine).
    FailTransient(&'static str),
    /// Fail with a permanent error (never retried).
    FailPermanent(&'static str),
    /// Sleep this long, observing cancellation, then succeed.
    Sleep(Duration),
}

/// Maintenance task that walks a scripted sequence of outcomes, one per run.
///
/// When the script runs dry, subsequent runs succeed with an empty report.
pub struct ScriptedTask {
    steps: Mutex<VecDeque<TaskStep>>,
    runs: AtomicU64,
}

impl ScriptedTask {
    /// Build a task from the outcome script.
    #[must_use]
    pub fn new(steps: Vec<TaskStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            runs: AtomicU64::new(0),
        }
    }

    /// How many times the task has been invoked.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MaintenanceTask for ScriptedTask {
    async fn run(&self, mut ctx: TaskContext) -> Result<TaskReport, VaultError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .expect("mutex poisoned")
            .pop_front()
            .unwrap_or(TaskStep::Succeed(TaskReport::default()));
        match step {
            TaskStep::Succeed(report) => Ok(report),
            TaskStep::FailTransient(msg) => Err(VaultError::transient(msg)),
            TaskStep::FailPermanent(msg) => Err(VaultError::Other(msg.to_string())),
            TaskStep::Sleep(d) => {
                tokio::select! {
                    () = tokio::time::sleep(d) => Ok(TaskReport::default()),
                    _ = ctx.cancel.changed() => Err(VaultError::Cancelled),
                }
            }
        }
    }
}
