//! Contracts and runtime-neutral utilities for the tickvault collection engine.
//!
//! Overview
//! - [`provider`] defines the abstract market-data provider contract: channel
//!   subscriptions, the non-blocking event sink, and the optional idle probe.
//! - [`archive`] defines the sink contract the pipeline consumer writes to.
//! - [`coordinator`] defines symbol-ownership coordination across instances.
//! - [`task`] provides the cooperative-stop handle used for every long-lived
//!   engine task (consumer, monitors, timers).
//!
//! Domain types live in `tickvault-types` and are re-exported here so
//! downstream crates can depend on `tickvault-core` only.
#![warn(missing_docs)]

pub mod archive;
pub mod coordinator;
pub mod provider;
pub mod task;

pub use archive::ArchiveWriter;
pub use coordinator::{Claim, InstanceCoordinator};
pub use provider::{EventSink, MarketDataProvider, MaintenanceTask, PingSender, TaskContext};
pub use task::TaskHandle;

pub use tickvault_types::*;
