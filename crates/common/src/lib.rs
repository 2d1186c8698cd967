#![deny(missing_docs)]

//! Shared identifiers, states, plan types and error taxonomy for cascade crates.
//!
//! Architecture role:
//! - defines the runtime data model (partitions, blocks, task groups, edges)
//! - provides common [`CascadeError`] / [`Result`] contracts
//! - hosts runtime configuration passed across master/executor layers
//!
//! Key modules:
//! - [`block`]
//! - [`config`]
//! - [`error`]
//! - [`hash_range`]
//! - [`ids`]
//! - [`plan`]
//! - [`states`]

/// Per-block metadata inside a partition.
pub mod block;
/// Shared runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Key hash ranges for shuffle reads.
pub mod hash_range;
/// Runtime identifier construction and parsing.
pub mod ids;
/// Task, task-group and edge descriptors.
pub mod plan;
/// Lifecycle state enumerations.
pub mod states;

pub use block::BlockMetadata;
pub use config::RuntimeConfig;
pub use error::{CascadeError, Result};
pub use hash_range::HashRange;
pub use plan::{
    BoundedSourceTask, EdgeProperties, MetricCollectionBarrierTask, OperatorTask, RuntimeEdge,
    ScheduledTaskGroup, StageEdge, Task, TaskDag, TaskGroup,
};
pub use states::{
    CommunicationPattern, DataStore, PartitionState, RecoverableFailureCause, TaskGroupState,
    TaskState,
};
