//! Per-event validators: sanity checks, sequence gating, tick-size, and
//! cross-provider divergence.
//!
//! Validators are pure checks over a single event. Data-quality findings are
//! never fatal: they materialize as integrity events back into the pipeline
//! and as cooldown-gated alerts. Only sanity failures reject an event.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use tokio::time::Instant;

use tickvault_types::{
    AlertCategory, AlertItem, AlertSeverity, EventKind, EventPayload, Integrity, IntegrityKind,
    MarketEvent, ProviderKey, Symbol, ValidatorConfig,
};

use crate::alerts::AlertAggregator;

/// Outcome of running the chain over one event.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Sequence duplicate; drop without storing.
    Duplicate,
    /// Sanity failure; drop and account as rejected.
    Reject(String),
    /// Store the event; `integrity` carries any synthesized anomaly events.
    Accept {
        /// Anomaly events to publish back into the pipeline.
        integrity: Vec<MarketEvent>,
    },
}

/// Rate-limits alerts per key; adapted last-seen map with a fixed cooldown.
pub(crate) struct CooldownGate {
    state: Mutex<HashMap<String, Instant>>,
    cooldown: Duration,
}

impl CooldownGate {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// `true` when the key is outside its cooldown; updates the stamp.
    pub(crate) fn allow(&self, key: &str) -> bool {
        let mut guard = self.state.lock().expect("mutex poisoned");
        let now = Instant::now();
        match guard.get_mut(key) {
            Some(last) if now.duration_since(*last) < self.cooldown => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                guard.insert(key.to_string(), now);
                true
            }
        }
    }
}

/// Result of the per-(symbol, provider, kind) sequence gate.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SeqCheck {
    Ok,
    /// Same sequence seen again.
    Duplicate,
    /// Sequence jumped forward, skipping `missing` numbers.
    Gap { missing: u64 },
    /// Sequence regressed beyond the reorder tolerance.
    OutOfOrder { lag_ms: i64 },
}

struct SeqEntry {
    last_seq: u64,
    last_exchange_ts: chrono::DateTime<Utc>,
}

/// Tracks last-seen sequence/timestamp per (symbol, provider, kind).
///
/// Regressions inside the reorder tolerance pass silently; the provider
/// contract allows single-source reorderings within a one-second window.
pub(crate) struct SequenceGate {
    state: Mutex<HashMap<(Symbol, ProviderKey, EventKind), SeqEntry>>,
    tolerance: chrono::Duration,
}

impl SequenceGate {
    pub(crate) fn new(tolerance: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            tolerance: chrono::Duration::from_std(tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
        }
    }

    pub(crate) fn check(&self, event: &MarketEvent) -> SeqCheck {
        let key = (event.symbol.clone(), event.provider.clone(), event.kind());
        let mut guard = self.state.lock().expect("mutex poisoned");
        match guard.get_mut(&key) {
            None => {
                guard.insert(
                    key,
                    SeqEntry {
                        last_seq: event.sequence,
                        last_exchange_ts: event.exchange_ts,
                    },
                );
                SeqCheck::Ok
            }
            Some(entry) => {
                if event.sequence == entry.last_seq {
                    return SeqCheck::Duplicate;
                }
                if event.sequence > entry.last_seq {
                    let missing = event.sequence - entry.last_seq - 1;
                    entry.last_seq = event.sequence;
                    entry.last_exchange_ts = event.exchange_ts;
                    if missing > 0 {
                        return SeqCheck::Gap { missing };
                    }
                    return SeqCheck::Ok;
                }
                // Regression: tolerated inside the reorder window.
                let lag = entry.last_exchange_ts - event.exchange_ts;
                if lag > self.tolerance {
                    SeqCheck::OutOfOrder {
                        lag_ms: lag.num_milliseconds(),
                    }
                } else {
                    SeqCheck::Ok
                }
            }
        }
    }
}

/// Tick-size check: price must sit on the symbol's tick grid within a
/// fractional tolerance.
pub(crate) struct TickSizeValidator {
    overrides: BTreeMap<String, Decimal>,
    tolerance: Decimal,
}

impl TickSizeValidator {
    pub(crate) fn new(overrides: BTreeMap<String, Decimal>, tolerance: f64) -> Self {
        Self {
            overrides,
            tolerance: Decimal::from_f64(tolerance).unwrap_or_else(|| Decimal::new(1, 3)),
        }
    }

    /// Default grid: $0.01 at or above $1, $0.0001 below.
    fn tick_for(&self, symbol: &Symbol, price: Decimal) -> Decimal {
        if let Some(tick) = self.overrides.get(symbol.as_str()) {
            return *tick;
        }
        if price >= Decimal::ONE {
            Decimal::new(1, 2)
        } else {
            Decimal::new(1, 4)
        }
    }

    /// `Some(detail)` when the price is off-grid beyond tolerance.
    pub(crate) fn check(&self, symbol: &Symbol, price: Decimal) -> Option<String> {
        if price <= Decimal::ZERO {
            return None; // sanity handles non-positive prices
        }
        let tick = self.tick_for(symbol, price);
        if tick <= Decimal::ZERO {
            return None;
        }
        let rem = price % tick;
        let dist = rem.min(tick - rem);
        if dist > tick * self.tolerance {
            Some(format!(
                "price {price} off tick grid {tick} (remainder {rem})"
            ))
        } else {
            None
        }
    }
}

/// Cross-provider mid divergence over a rolling window.
pub(crate) struct DivergenceValidator {
    window: Duration,
    threshold_bps: f64,
    mids: Mutex<HashMap<Symbol, HashMap<ProviderKey, VecDeque<(Instant, f64)>>>>,
}

impl DivergenceValidator {
    pub(crate) fn new(window: Duration, threshold_bps: f64) -> Self {
        Self {
            window,
            threshold_bps,
            mids: Mutex::new(HashMap::new()),
        }
    }

    /// Record one provider mid and return `Some(detail)` when the spread
    /// across providers' latest in-window mids crosses the threshold.
    pub(crate) fn observe(
        &self,
        symbol: &Symbol,
        provider: &ProviderKey,
        mid: f64,
    ) -> Option<String> {
        let now = Instant::now();
        let mut guard = self.mids.lock().expect("mutex poisoned");
        let per_provider = guard.entry(symbol.clone()).or_default();
        let deque = per_provider.entry(provider.clone()).or_default();
        deque.push_back((now, mid));

        let mut latest: Vec<f64> = Vec::new();
        for samples in per_provider.values_mut() {
            while let Some((t, _)) = samples.front() {
                if now.duration_since(*t) > self.window {
                    samples.pop_front();
                } else {
                    break;
                }
            }
            if let Some((_, m)) = samples.back() {
                latest.push(*m);
            }
        }
        if latest.len() < 2 {
            return None;
        }
        let max = latest.iter().copied().fold(f64::MIN, f64::max);
        let min = latest.iter().copied().fold(f64::MAX, f64::min);
        let avg = latest.iter().sum::<f64>() / latest.len() as f64;
        if avg <= 0.0 {
            return None;
        }
        let spread_bps = (max - min) / avg * 10_000.0;
        if spread_bps >= self.threshold_bps {
            Some(format!(
                "mid spread {spread_bps:.1} bps across {} providers (min {min}, max {max})",
                latest.len()
            ))
        } else {
            None
        }
    }
}

/// The consumer-side chain: sanity, sequence gate, tick-size, divergence.
pub(crate) struct ValidatorChain {
    seq_gate: SequenceGate,
    tick: TickSizeValidator,
    divergence: DivergenceValidator,
    cooldown: CooldownGate,
    alerts: Option<std::sync::Arc<AlertAggregator>>,
    next_integrity_id: AtomicU64,
}

impl ValidatorChain {
    pub(crate) fn new(
        cfg: &ValidatorConfig,
        alerts: Option<std::sync::Arc<AlertAggregator>>,
    ) -> Self {
        Self {
            seq_gate: SequenceGate::new(cfg.reorder_tolerance),
            tick: TickSizeValidator::new(cfg.tick_overrides.clone(), cfg.tick_tolerance),
            divergence: DivergenceValidator::new(
                cfg.divergence_window,
                cfg.divergence_threshold_bps,
            ),
            cooldown: CooldownGate::new(cfg.alert_cooldown),
            alerts,
            next_integrity_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn process(&self, event: &MarketEvent) -> Verdict {
        // Engine-synthesized anomalies pass straight through.
        if event.kind() == EventKind::Integrity {
            return Verdict::Accept {
                integrity: Vec::new(),
            };
        }

        if let Some(reason) = sanity(event) {
            return Verdict::Reject(reason);
        }

        let mut integrity = Vec::new();
        match self.seq_gate.check(event) {
            SeqCheck::Duplicate => return Verdict::Duplicate,
            SeqCheck::Gap { missing } => {
                let detail = format!(
                    "sequence gap on {}: {missing} missing before {}",
                    event.symbol, event.sequence
                );
                integrity.push(self.integrity_event(event, IntegrityKind::Gap, &detail));
                self.raise(event, IntegrityKind::Gap, &detail);
            }
            SeqCheck::OutOfOrder { lag_ms } => {
                let detail = format!(
                    "out-of-order event on {}: {lag_ms} ms behind last seen",
                    event.symbol
                );
                integrity.push(self.integrity_event(event, IntegrityKind::OutOfOrder, &detail));
                self.raise(event, IntegrityKind::OutOfOrder, &detail);
            }
            SeqCheck::Ok => {}
        }

        match &event.payload {
            EventPayload::Trade(trade) => {
                if let Some(detail) = self.tick.check(&event.symbol, trade.price) {
                    integrity.push(self.integrity_event(event, IntegrityKind::TickSize, &detail));
                    self.raise(event, IntegrityKind::TickSize, &detail);
                }
            }
            EventPayload::BboQuote(quote) => {
                if let Some(mid) = quote.mid()
                    && let Some(mid_f) = mid.to_f64()
                    && let Some(detail) =
                        self.divergence.observe(&event.symbol, &event.provider, mid_f)
                {
                    integrity.push(self.integrity_event(event, IntegrityKind::Divergence, &detail));
                    self.raise(event, IntegrityKind::Divergence, &detail);
                }
            }
            _ => {}
        }

        Verdict::Accept { integrity }
    }

    fn integrity_event(
        &self,
        source: &MarketEvent,
        check: IntegrityKind,
        detail: &str,
    ) -> MarketEvent {
        let now = Utc::now();
        MarketEvent {
            event_id: self.next_integrity_id.fetch_add(1, Ordering::Relaxed),
            symbol: source.symbol.clone(),
            exchange_ts: source.exchange_ts,
            received_at: now,
            provider: source.provider.clone(),
            sequence: source.sequence,
            payload: EventPayload::Integrity(Integrity {
                check,
                detail: detail.to_string(),
            }),
        }
    }

    fn raise(&self, event: &MarketEvent, check: IntegrityKind, detail: &str) {
        let Some(alerts) = &self.alerts else { return };
        let key = format!("{}:{check}", event.symbol);
        if !self.cooldown.allow(&key) {
            return;
        }
        alerts.submit(AlertItem {
            category: AlertCategory::DataQuality,
            severity: AlertSeverity::Warning,
            title: format!("{check} violation"),
            message: format!("{}: {detail}", event.symbol),
            source: check.to_string(),
            fingerprint: Some(key),
            timestamp: Utc::now(),
        });
    }
}

/// Basic shape checks; failures reject the event outright.
fn sanity(event: &MarketEvent) -> Option<String> {
    match &event.payload {
        EventPayload::Trade(t) => {
            if t.price <= Decimal::ZERO {
                return Some(format!("non-positive trade price {}", t.price));
            }
            if t.size == 0 {
                return Some("zero trade size".to_string());
            }
        }
        EventPayload::BboQuote(q) => {
            if q.bid < Decimal::ZERO || q.ask < Decimal::ZERO {
                return Some("negative quote price".to_string());
            }
        }
        EventPayload::Bar(b) => {
            if b.high < b.low {
                return Some(format!("bar high {} below low {}", b.high, b.low));
            }
        }
        EventPayload::DepthUpdate(d) => {
            if d.price < Decimal::ZERO {
                return Some("negative depth price".to_string());
            }
        }
        EventPayload::Integrity(_) => {}
    }
    None
}
