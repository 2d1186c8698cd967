//! Lifecycle state enumerations shared between master and executors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of one intermediate data partition, tracked by the master.
///
/// Valid transitions form a DAG; see [`PartitionState::can_transition_to`].
/// Re-entry into `Scheduled` from a lost state represents a new production
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Partition is initialized but its producer is not yet scheduled.
    Ready,
    /// Producer task group is enqueued; an owner executor may be assigned but
    /// the bytes are not necessarily written yet.
    Scheduled,
    /// Partition bytes are fully written and visible at its owner location.
    Committed,
    /// A committed partition whose owner executor was lost.
    Lost,
    /// A scheduled (never committed) partition whose producer failed.
    LostBeforeCommit,
    /// Partition was explicitly removed; terminal for this generation.
    Removed,
}

impl PartitionState {
    /// Returns whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, next),
            (Ready, Scheduled)
                | (Scheduled, Committed)
                | (Scheduled, LostBeforeCommit)
                | (Committed, Lost)
                | (Lost, Scheduled)
                | (Lost, Removed)
                | (LostBeforeCommit, Scheduled)
        )
    }

    /// Returns whether a location query can be served in this state.
    ///
    /// `Scheduled` partitions are servable because their location future will
    /// resolve once the producer commits.
    pub fn is_servable(self) -> bool {
        matches!(self, PartitionState::Scheduled | PartitionState::Committed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Ready => "READY",
            PartitionState::Scheduled => "SCHEDULED",
            PartitionState::Committed => "COMMITTED",
            PartitionState::Lost => "LOST",
            PartitionState::LostBeforeCommit => "LOST_BEFORE_COMMIT",
            PartitionState::Removed => "REMOVED",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle states of one task group, reported by executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskGroupState {
    /// Task group is dispatched but not yet running.
    Ready,
    /// Task group is executing its task DAG.
    Executing,
    /// Every task in the group completed.
    Complete,
    /// A task failed in a way the scheduler can recover by rescheduling.
    FailedRecoverable,
    /// A task failed in a way that terminates the job attempt.
    FailedUnrecoverable,
    /// The group is parked at a metric collection barrier awaiting
    /// dynamic optimization by the master.
    OnHold,
}

impl fmt::Display for TaskGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskGroupState::Ready => "READY",
            TaskGroupState::Executing => "EXECUTING",
            TaskGroupState::Complete => "COMPLETE",
            TaskGroupState::FailedRecoverable => "FAILED_RECOVERABLE",
            TaskGroupState::FailedUnrecoverable => "FAILED_UNRECOVERABLE",
            TaskGroupState::OnHold => "ON_HOLD",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle states of one task within a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Task is waiting for its turn in the topological walk.
    Ready,
    /// Task is executing.
    Executing,
    /// Task finished and its outputs are closed.
    Complete,
    /// Task hit a recoverable I/O failure.
    FailedRecoverable,
    /// Task hit an unrecoverable failure.
    FailedUnrecoverable,
    /// Task is parked at a metric collection barrier.
    OnHold,
}

/// Cause attached to recoverable task/task-group failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoverableFailureCause {
    /// A read-side channel failed.
    InputReadFailure,
    /// A write-side channel failed.
    OutputWriteFailure,
}

/// How source-task outputs are consumed by destination tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunicationPattern {
    /// Destination index `i` reads exactly source index `i`.
    OneToOne,
    /// Every destination reads every source partition in full.
    Broadcast,
    /// Destinations read disjoint hash ranges of every source partition.
    Shuffle,
}

/// Which block store backs an edge's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStore {
    /// Process-local store of decoded records.
    Memory,
    /// Process-local store of coder-encoded block bytes.
    SerializedMemory,
    /// Executor-local files under the local store root.
    LocalFile,
    /// Files on a shared root reachable by every executor.
    RemoteFile,
}

impl DataStore {
    /// Returns whether partitions in this store live outside any one executor.
    pub fn is_remote(self) -> bool {
        matches!(self, DataStore::RemoteFile)
    }
}
