//! The archive sink contract.

use async_trait::async_trait;

use tickvault_types::{MarketEvent, VaultError};

/// Columnar archive sink the pipeline consumer writes to.
///
/// The engine assumes a single writer per (symbol, date, kind); the consumer
/// task serializes all writes, so implementations need not be re-entrant for
/// the same partition. Write failures are accounted as `store_failed` and the
/// event is discarded; durability belongs upstream of the pipeline.
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// Persist one event.
    async fn write(&self, event: &MarketEvent) -> Result<(), VaultError>;

    /// Flush buffered partitions.
    async fn flush(&self) -> Result<(), VaultError>;

    /// Flush and release resources. Called once at shutdown.
    async fn close(&self) -> Result<(), VaultError>;
}
