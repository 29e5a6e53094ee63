use std::fmt;

use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Provider channel a subscription lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Tick-level trades.
    Trades,
    /// Level-2 depth.
    Depth,
    /// Option trades (options never subscribe depth).
    OptionTrades,
}

impl Channel {
    /// Stable kebab-case identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Depth => "depth",
            Self::OptionTrades => "option-trades",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an active subscription row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionState {
    /// Subscribe requested, no id yet.
    Pending,
    /// Live with a provider-assigned id.
    Active,
    /// Subscribe failed; retried on the next apply.
    Failed {
        /// Why the subscribe failed.
        reason: String,
    },
    /// Unsubscribed.
    Closed,
}

/// One row per (symbol, channel), owned by the orchestrator.
///
/// `id >= 1` is a live provider-assigned id; `-1` is the requested-but-failed
/// sentinel that the next apply retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Channel the row lives on.
    pub channel: Channel,
    /// Provider-assigned id, or `-1` when the subscribe failed.
    pub id: i64,
    /// Lifecycle state.
    pub state: SubscriptionState,
}
