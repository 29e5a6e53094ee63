use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Stable identifier of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    /// Build a key from a provider name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Discriminator for the event payload union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventKind {
    /// A tick-level trade print.
    Trade,
    /// Best bid and offer update.
    BboQuote,
    /// Level-2 book delta.
    DepthUpdate,
    /// Aggregated OHLCV bar.
    Bar,
    /// Engine-detected anomaly (gap, out-of-order, tick-size, divergence).
    Integrity,
}

impl EventKind {
    /// All kinds, in tally-array order.
    pub const ALL: [Self; 5] = [
        Self::Trade,
        Self::BboQuote,
        Self::DepthUpdate,
        Self::Bar,
        Self::Integrity,
    ];

    /// Stable kebab-case identifier for logs and archive paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::BboQuote => "bbo-quote",
            Self::DepthUpdate => "depth-update",
            Self::Bar => "bar",
            Self::Integrity => "integrity",
        }
    }

    /// Dense index used for per-kind counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Trade => 0,
            Self::BboQuote => 1,
            Self::DepthUpdate => 2,
            Self::Bar => 3,
            Self::Integrity => 4,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: u64,
}

/// Best bid and offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BboQuote {
    /// Best bid price.
    pub bid: Decimal,
    /// Size at the best bid.
    pub bid_size: u64,
    /// Best ask price.
    pub ask: Decimal,
    /// Size at the best ask.
    pub ask_size: u64,
}

impl BboQuote {
    /// Mid price, or `None` when either side is empty.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return None;
        }
        Some((self.bid + self.ask) / Decimal::TWO)
    }
}

/// Book side of a depth delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookSide {
    /// Bid side.
    Bid,
    /// Ask side.
    Ask,
}

/// Operation carried by a depth delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepthOp {
    /// New level inserted.
    Insert,
    /// Existing level updated in place.
    Update,
    /// Level removed.
    Delete,
}

/// Level-2 book delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Which side of the book.
    pub side: BookSide,
    /// Zero-based level position.
    pub level: u8,
    /// Price at the level.
    pub price: Decimal,
    /// Size at the level.
    pub size: u64,
    /// Insert/update/delete.
    pub op: DepthOp,
}

/// Aggregated OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open timestamp.
    pub period_start: DateTime<Utc>,
    /// Bar length in seconds.
    pub period_secs: u32,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: u64,
}

/// Classification of a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum IntegrityKind {
    /// Sequence gap detected.
    Gap,
    /// Event arrived out of order beyond the reorder tolerance.
    OutOfOrder,
    /// Price violates the symbol's tick size.
    TickSize,
    /// Cross-provider mid-price divergence.
    Divergence,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gap => "gap",
            Self::OutOfOrder => "out-of-order",
            Self::TickSize => "tick-size",
            Self::Divergence => "divergence",
        };
        f.write_str(s)
    }
}

/// Anomaly payload materialized into the pipeline by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    /// Which check fired.
    pub check: IntegrityKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Kind-tagged payload union for [`MarketEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventPayload {
    /// Trade print.
    Trade(Trade),
    /// Best bid/offer update.
    BboQuote(BboQuote),
    /// Depth delta.
    DepthUpdate(DepthUpdate),
    /// OHLCV bar.
    Bar(Bar),
    /// Detected anomaly.
    Integrity(Integrity),
}

impl EventPayload {
    /// The discriminator for this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Trade(_) => EventKind::Trade,
            Self::BboQuote(_) => EventKind::BboQuote,
            Self::DepthUpdate(_) => EventKind::DepthUpdate,
            Self::Bar(_) => EventKind::Bar,
            Self::Integrity(_) => EventKind::Integrity,
        }
    }
}

/// One normalized event flowing through the pipeline.
///
/// `sequence` is monotonic non-decreasing per (symbol, provider, kind) under
/// the provider contract; single-source reorderings within a one-second
/// window are tolerated downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Engine-assigned id, unique within the process lifetime.
    pub event_id: u64,
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Exchange timestamp as reported by the provider.
    pub exchange_ts: DateTime<Utc>,
    /// Wall-clock arrival time at this process.
    pub received_at: DateTime<Utc>,
    /// Originating provider.
    pub provider: ProviderKey,
    /// Provider sequence number, per (symbol, provider, kind).
    pub sequence: u64,
    /// Kind-tagged payload.
    pub payload: EventPayload,
}

impl MarketEvent {
    /// The payload discriminator.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Observed clock skew for this event, in milliseconds.
    #[must_use]
    pub fn skew_ms(&self) -> i64 {
        (self.received_at - self.exchange_ts).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_matches_discriminator() {
        let p = EventPayload::Trade(Trade {
            price: Decimal::new(18525, 2),
            size: 100,
        });
        assert_eq!(p.kind(), EventKind::Trade);
        assert_eq!(p.kind().as_str(), "trade");
    }

    #[test]
    fn mid_requires_both_sides() {
        let q = BboQuote {
            bid: Decimal::ZERO,
            bid_size: 0,
            ask: Decimal::new(10, 0),
            ask_size: 5,
        };
        assert!(q.mid().is_none());
        let q = BboQuote {
            bid: Decimal::new(9, 0),
            bid_size: 1,
            ask: Decimal::new(11, 0),
            ask_size: 1,
        };
        assert_eq!(q.mid().unwrap(), Decimal::new(10, 0));
    }

    #[test]
    fn payload_serde_is_kind_tagged() {
        let p = EventPayload::Integrity(Integrity {
            check: IntegrityKind::TickSize,
            detail: "remainder 0.005".into(),
        });
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "integrity");
    }
}
