//! Symbol-ownership coordination across collector instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tickvault_types::Symbol;

/// One instance's claim on one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claiming instance.
    pub instance_id: String,
    /// Claimed symbol.
    pub symbol: Symbol,
    /// Last heartbeat refresh; claims older than the TTL are reclaimable.
    pub heartbeat_at: DateTime<Utc>,
}

/// Ownership coordinator: each symbol is collected by exactly one instance.
///
/// The orchestrator filters the desired set through [`try_claim`] before
/// subscribing. Implementations may be a no-op (single instance), file locks,
/// or an external lock service; heartbeats older than the TTL
/// (3 x heartbeat-interval by default) are reclaimable by anyone.
///
/// [`try_claim`]: InstanceCoordinator::try_claim
pub trait InstanceCoordinator: Send + Sync {
    /// Claim a symbol for this instance. `true` when this instance owns it
    /// afterwards (idempotent for already-owned symbols).
    fn try_claim(&self, symbol: &Symbol) -> bool;

    /// Release a symbol owned by this instance.
    fn release(&self, symbol: &Symbol);

    /// Refresh the heartbeat on every claim this instance holds.
    fn refresh_heartbeat(&self);

    /// Symbols currently owned by this instance.
    fn owned(&self) -> Vec<Symbol>;

    /// All claims visible to this instance, including other instances'.
    fn all_claims(&self) -> Vec<Claim>;

    /// Remove claims whose heartbeat exceeded the TTL; returns how many.
    fn reclaim_stale(&self) -> usize;
}
