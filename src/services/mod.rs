//! Services built on the storage backends.
//!
//! - [`BackendFactory`]: picks the backend, probes the host, falls back
//! - [`MigrationCoordinator`]: one-time legacy flat-file import

mod backend_factory;
mod migration;

pub use backend_factory::{
    BackendFactory, BackendStatus, CapabilityProbe, ProbeReport, SqliteSelfTest, StoreHandle,
};
pub use migration::{MigrationCoordinator, MigrationOutcome, MigrationReport, Resolution};
