//! Master-side runtime: cluster-wide partition lifecycle tracking, location
//! queries, and worker-loss recovery.
//!
//! Architecture role:
//! - per-partition state machine with a resettable location future
//! - registry of partitions and their producer task groups
//! - the `runtime-master` control listener wiring executors to both
//!
//! Key modules:
//! - [`partition_metadata`]
//! - [`partition_manager`]
//! - [`runtime_master`]

pub mod partition_manager;
pub mod partition_metadata;
pub mod runtime_master;

pub use partition_manager::PartitionManagerMaster;
pub use partition_metadata::{AbsentLocation, LocationFuture, PartitionMetadata};
pub use runtime_master::{RuntimeMaster, SchedulerContract};
