//! Subscription orchestration: diff desired vs. active, execute the plan
//! against the active provider, commit under one lock.

mod plan;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use serde::{Deserialize, Serialize};

use tickvault_core::{InstanceCoordinator, MarketDataProvider};
use tickvault_types::{
    ActiveSubscription, Channel, ProviderKey, SubscriptionCounts, SubscriptionState, Symbol,
    SymbolSpec, VaultError,
};

use crate::health::degradation::DegradationScorer;
use crate::persist;
use plan::{ActiveMaps, FAILED_SENTINEL, PlanStep, build_plan};

/// Counts from one apply pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Successful subscribes.
    pub subscribed: usize,
    /// Rows removed (provider called or sentinel dropped).
    pub unsubscribed: usize,
    /// Subscribes that failed and were left as the retry sentinel.
    pub failed: usize,
}

struct Inner {
    active_idx: usize,
    prev: BTreeMap<Symbol, SymbolSpec>,
    active: ActiveMaps,
}

/// On-disk shape of the last-known subscription set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionStateFile {
    desired: Vec<SymbolSpec>,
    rows: Vec<ActiveSubscription>,
}

/// Reconciles the desired symbol set against live provider subscriptions.
///
/// The whole apply runs under a single lock so the three id maps stay
/// consistent; every provider call under the lock is bounded by the per-call
/// timeout, which bounds the apply as a whole.
pub struct Orchestrator {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    inner: Mutex<Inner>,
    call_timeout: Duration,
    coordinator: Arc<dyn InstanceCoordinator>,
    scorer: Option<Arc<DegradationScorer>>,
    state_path: Option<PathBuf>,
}

impl Orchestrator {
    /// Build an orchestrator over the registered providers.
    pub(crate) fn new(
        providers: Vec<Arc<dyn MarketDataProvider>>,
        call_timeout: Duration,
        coordinator: Arc<dyn InstanceCoordinator>,
        scorer: Option<Arc<DegradationScorer>>,
        state_path: Option<PathBuf>,
    ) -> Self {
        Self {
            providers,
            inner: Mutex::new(Inner {
                active_idx: 0,
                prev: BTreeMap::new(),
                active: ActiveMaps::default(),
            }),
            call_timeout,
            coordinator,
            scorer,
            state_path,
        }
    }

    /// The provider currently receiving subscriptions, if any is registered.
    pub async fn active_provider(&self) -> Option<ProviderKey> {
        let inner = self.inner.lock().await;
        self.providers.get(inner.active_idx).map(|p| p.key())
    }

    /// Registered provider keys, in registration order.
    #[must_use]
    pub fn provider_keys(&self) -> Vec<ProviderKey> {
        self.providers.iter().map(|p| p.key()).collect()
    }

    /// Apply a desired symbol set.
    ///
    /// Validation errors surface immediately; provider failures never do:
    /// they are logged, recorded as the failed sentinel, and retried on the
    /// next apply.
    pub async fn apply(&self, desired: Vec<SymbolSpec>) -> Result<ApplyOutcome, VaultError> {
        for spec in &desired {
            spec.validate()?;
        }
        if self.providers.is_empty() {
            if desired.is_empty() {
                return Ok(ApplyOutcome::default());
            }
            return Err(VaultError::invalid_arg(
                "cannot apply symbols with no registered providers",
            ));
        }

        // Ownership filter: only claimed symbols are subscribed here.
        let mut desired_map: BTreeMap<Symbol, SymbolSpec> = BTreeMap::new();
        for spec in desired {
            if self.coordinator.try_claim(&spec.symbol) {
                desired_map.insert(spec.symbol.clone(), spec);
            } else {
                info!(symbol = %spec.symbol, "symbol owned by another instance; skipping");
            }
        }

        let mut inner = self.inner.lock().await;
        for symbol in inner.prev.keys() {
            if !desired_map.contains_key(symbol) {
                self.coordinator.release(symbol);
            }
        }

        let steps = build_plan(&inner.prev, &desired_map, &inner.active);
        let outcome = self.execute(&mut inner, steps).await;
        inner.prev = desired_map;
        self.persist_locked(&inner);
        Ok(outcome)
    }

    /// Tear down the active provider's rows and resubscribe the previous
    /// desired set on `key`.
    pub async fn failover_to(&self, key: &ProviderKey) -> Result<ApplyOutcome, VaultError> {
        let target = self
            .providers
            .iter()
            .position(|p| p.key() == *key)
            .ok_or_else(|| VaultError::not_found(format!("provider {key}")))?;

        let mut inner = self.inner.lock().await;
        if inner.active_idx == target {
            return Ok(ApplyOutcome::default());
        }

        // Best-effort teardown on the old provider.
        let teardown: Vec<PlanStep> = inner
            .active
            .rows()
            .into_iter()
            .map(|(channel, symbol, id)| PlanStep::Unsubscribe {
                channel,
                symbol,
                id,
            })
            .collect();
        let torn_down = self.execute(&mut inner, teardown).await;

        info!(from = inner.active_idx, to = target, provider = %key, "failing over subscriptions");
        inner.active_idx = target;
        let resubscribe = build_plan(&BTreeMap::new(), &inner.prev.clone(), &inner.active);
        let mut outcome = self.execute(&mut inner, resubscribe).await;
        outcome.unsubscribed += torn_down.unsubscribed;
        self.persist_locked(&inner);
        Ok(outcome)
    }

    async fn execute(&self, inner: &mut Inner, steps: Vec<PlanStep>) -> ApplyOutcome {
        let provider = Arc::clone(&self.providers[inner.active_idx]);
        let key = provider.key();
        let mut outcome = ApplyOutcome::default();

        for step in steps {
            match step {
                PlanStep::Unsubscribe {
                    channel,
                    symbol,
                    id,
                } => {
                    if id >= 1 {
                        let call = async {
                            match channel {
                                Channel::Trades => provider.unsubscribe_trades(id).await,
                                Channel::Depth => provider.unsubscribe_depth(id).await,
                                Channel::OptionTrades => {
                                    provider.unsubscribe_option_trades(id).await
                                }
                            }
                        };
                        match tokio::time::timeout(self.call_timeout, call).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                // Unsubscribe errors are never fatal.
                                warn!(provider = %key, %channel, %symbol, error = %err, "unsubscribe failed");
                            }
                            Err(_) => {
                                warn!(provider = %key, %channel, %symbol, "unsubscribe timed out");
                            }
                        }
                    }
                    inner.active.map_mut(channel).remove(&symbol);
                    outcome.unsubscribed += 1;
                }
                PlanStep::Subscribe { channel, spec } => {
                    let call = async {
                        match channel {
                            Channel::Trades => provider.subscribe_trades(&spec).await,
                            Channel::Depth => provider.subscribe_depth(&spec).await,
                            Channel::OptionTrades => provider.subscribe_option_trades(&spec).await,
                        }
                    };
                    let symbol = spec.symbol.clone();
                    let result = tokio::time::timeout(self.call_timeout, call).await;
                    let id = match result {
                        Ok(Ok(id)) if id >= 1 => {
                            if let Some(scorer) = &self.scorer {
                                scorer.record_outcome(&key, true);
                            }
                            outcome.subscribed += 1;
                            id
                        }
                        Ok(Ok(id)) => {
                            warn!(provider = %key, %channel, %symbol, id, "subscribe returned non-positive id");
                            self.note_failure(&key);
                            outcome.failed += 1;
                            FAILED_SENTINEL
                        }
                        Ok(Err(err)) => {
                            warn!(provider = %key, %channel, %symbol, error = %err, "subscribe failed");
                            self.note_failure(&key);
                            outcome.failed += 1;
                            FAILED_SENTINEL
                        }
                        Err(_) => {
                            warn!(provider = %key, %channel, %symbol, "subscribe timed out");
                            self.note_failure(&key);
                            outcome.failed += 1;
                            FAILED_SENTINEL
                        }
                    };
                    inner.active.map_mut(channel).insert(symbol, id);
                }
            }
        }
        outcome
    }

    fn note_failure(&self, key: &ProviderKey) {
        if let Some(scorer) = &self.scorer {
            scorer.record_outcome(key, false);
        }
    }

    fn persist_locked(&self, inner: &Inner) {
        let Some(path) = &self.state_path else { return };
        let state = SubscriptionStateFile {
            desired: inner.prev.values().cloned().collect(),
            rows: Self::rows_from(inner),
        };
        if let Err(err) = persist::write_json_atomic(path, &state) {
            warn!(error = %err, "failed to persist subscription state");
        }
    }

    /// The last persisted desired set, for resubscription after a restart
    /// when the configuration carries no symbols of its own.
    #[must_use]
    pub fn recovered_desired(&self) -> Option<Vec<SymbolSpec>> {
        let path = self.state_path.as_ref()?;
        let state: SubscriptionStateFile = persist::read_json(path).ok().flatten()?;
        if state.desired.is_empty() {
            None
        } else {
            Some(state.desired)
        }
    }

    fn rows_from(inner: &Inner) -> Vec<ActiveSubscription> {
        let mut rows: Vec<ActiveSubscription> = inner
            .active
            .rows()
            .into_iter()
            .map(|(channel, symbol, id)| ActiveSubscription {
                symbol,
                channel,
                id,
                state: if id >= 1 {
                    SubscriptionState::Active
                } else {
                    SubscriptionState::Failed {
                        reason: "subscribe failed; pending retry".to_string(),
                    }
                },
            })
            .collect();
        rows.sort_by(|a, b| (a.symbol.clone(), a.channel.as_str()).cmp(&(b.symbol.clone(), b.channel.as_str())));
        rows
    }

    /// Current rows, for status and tests.
    pub async fn rows(&self) -> Vec<ActiveSubscription> {
        let inner = self.inner.lock().await;
        Self::rows_from(&inner)
    }

    /// Per-channel subscription tallies.
    pub async fn counts(&self) -> SubscriptionCounts {
        let inner = self.inner.lock().await;
        let mut counts = SubscriptionCounts::default();
        for (channel, _, id) in inner.active.rows() {
            if id < 1 {
                counts.failed += 1;
                continue;
            }
            match channel {
                Channel::Trades => counts.trades += 1,
                Channel::Depth => counts.depth += 1,
                Channel::OptionTrades => counts.option_trades += 1,
            }
        }
        counts
    }

    /// Unsubscribe everything and release claims. Used at shutdown.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        if self.providers.is_empty() {
            return;
        }
        let steps: Vec<PlanStep> = inner
            .active
            .rows()
            .into_iter()
            .map(|(channel, symbol, id)| PlanStep::Unsubscribe {
                channel,
                symbol,
                id,
            })
            .collect();
        let _ = self.execute(&mut inner, steps).await;
        for symbol in inner.prev.keys() {
            self.coordinator.release(symbol);
        }
        inner.prev.clear();
        self.persist_locked(&inner);
    }
}
