//! Control wire format.
//!
//! Each message is a tagged union: an id, the logical listener it is
//! addressed to, and exactly one payload. All operations triggered by these
//! messages are idempotent on partition id + state, so at-least-once delivery
//! with duplicates is tolerated.

use serde::{Deserialize, Serialize};

use cascade_common::states::{
    PartitionState, RecoverableFailureCause, TaskGroupState,
};
use cascade_common::BlockMetadata;

/// One control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Process-unique message id; replies echo it as `request_id`.
    pub id: u64,
    /// Logical listener this message is addressed to.
    pub listener_id: String,
    /// The single payload.
    pub payload: Payload,
}

impl Message {
    /// Builds a message addressed to `listener_id`.
    pub fn new(listener_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: cascade_common::ids::generate_message_id(),
            listener_id: listener_id.into(),
            payload,
        }
    }
}

/// The payload variants of the control protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Scheduler hands a serialized `ScheduledTaskGroup` to an executor.
    ScheduleTaskGroup {
        /// Encoded task group descriptor.
        task_group: Vec<u8>,
    },
    /// Executor reports a task-group state transition.
    TaskGroupStateChanged {
        /// Reporting executor.
        executor_id: String,
        /// Task group that changed state.
        task_group_id: String,
        /// New state.
        state: TaskGroupState,
        /// Tasks currently parked at a metric collection barrier.
        tasks_on_hold: Vec<String>,
        /// Cause attached to recoverable failures.
        failure_cause: Option<RecoverableFailureCause>,
        /// Attempt the report belongs to; the master deduplicates by
        /// `(task group, attempt, state)`.
        attempt_index: u32,
    },
    /// Executor reports a partition (block) state transition.
    BlockStateChanged {
        /// Reporting executor.
        executor_id: String,
        /// Partition that changed state.
        block_id: String,
        /// New state.
        state: PartitionState,
        /// Owner location, for transitions that carry one.
        location: Option<String>,
    },
    /// Executor asks the master where a partition lives.
    RequestBlockLocation {
        /// Requesting executor.
        executor_id: String,
        /// Partition being located.
        block_id: String,
    },
    /// Master answers a `RequestBlockLocation`.
    BlockLocationInfo {
        /// Id of the request message being answered.
        request_id: u64,
        /// Partition the answer is about.
        block_id: String,
        /// Partition state when the location was not resolvable.
        state: Option<PartitionState>,
        /// Owner executor when the partition is committed.
        owner_executor_id: Option<String>,
    },
    /// Executor asks the master to reserve a block slot in a remote
    /// partition's metadata.
    ReservePartition {
        /// Requesting executor.
        executor_id: String,
        /// Partition the block belongs to.
        block_id: String,
        /// Metadata of the block being reserved.
        block_metadata: BlockMetadata,
    },
    /// Master answers a `ReservePartition`.
    ReservePartitionResponse {
        /// Id of the request message being answered.
        request_id: u64,
        /// Byte position the writer must write at, when reservation succeeded.
        position_to_write: Option<u64>,
        /// Index of the reserved block in the partition's metadata list.
        partition_index: Option<u32>,
    },
    /// Executor reports per-bucket sizes of a skew-aware write.
    DataSizeMetric {
        /// Bytes written per hash bucket, indexed by bucket.
        partition_sizes: Vec<u64>,
        /// Partition the sizes belong to.
        block_id: String,
        /// Vertex that produced the data.
        src_vertex_id: String,
    },
    /// A task group escaped with an unrecoverable error.
    ExecutorFailed {
        /// Failing executor.
        executor_id: String,
        /// Serialized error payload.
        exception: Vec<u8>,
    },
    /// The container hosting an executor died.
    ContainerFailed {
        /// Lost executor.
        executor_id: String,
    },
}

impl Payload {
    /// Short tag used in logs and illegal-message errors.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::ScheduleTaskGroup { .. } => "ScheduleTaskGroup",
            Payload::TaskGroupStateChanged { .. } => "TaskGroupStateChanged",
            Payload::BlockStateChanged { .. } => "BlockStateChanged",
            Payload::RequestBlockLocation { .. } => "RequestBlockLocation",
            Payload::BlockLocationInfo { .. } => "BlockLocationInfo",
            Payload::ReservePartition { .. } => "ReservePartition",
            Payload::ReservePartitionResponse { .. } => "ReservePartitionResponse",
            Payload::DataSizeMetric { .. } => "DataSizeMetric",
            Payload::ExecutorFailed { .. } => "ExecutorFailed",
            Payload::ContainerFailed { .. } => "ContainerFailed",
        }
    }
}
