//! Data models for intellistore.
//!
//! One module per entity kind owned by the storage backends, plus the
//! [`FullSnapshot`] used for bulk load, bulk save and migration.

mod edge;
mod kv;
mod memory;
mod snapshot;
mod stats;
mod trajectory;
mod value_table;

pub use edge::Edge;
pub use kv::KvEntry;
pub use memory::{MemoryId, MemoryRecord, MemoryResult};
pub use snapshot::{CompleteSnapshot, FullSnapshot, Table, TableCounts};
pub use stats::StatCounter;
pub use trajectory::{Trajectory, TrajectoryId, TrajectoryStep};
pub use value_table::{ValueKey, ValueTableRow};
