use thiserror::Error;

use crate::states::PartitionState;

/// Canonical cascade error taxonomy used across crates.
///
/// Classification guidance:
/// - [`CascadeError::AbsentPartition`]: a location query hit a partition that
///   is not servable; the caller retries after the scheduler rebuilds
/// - [`CascadeError::BlockFetch`] / [`CascadeError::BlockWrite`]: I/O-level
///   channel failures, always recoverable at task-group granularity
/// - [`CascadeError::UnsupportedCommPattern`] / [`CascadeError::IllegalMessage`]:
///   programming/protocol errors, unrecoverable
/// - [`CascadeError::DeadlineExceeded`]: a control request whose reply was
///   dropped or timed out
/// - [`CascadeError::Unknown`]: catch-all, unrecoverable
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Requested partition is not in a servable state.
    ///
    /// Carries the partition state observed at query time so the caller can
    /// decide whether to retry after recomputation.
    #[error("partition '{partition_id}' is absent in state {state}")]
    AbsentPartition {
        /// Id of the queried partition.
        partition_id: String,
        /// State the partition was in when the query was served.
        state: PartitionState,
    },

    /// Failed to fetch block data at a channel boundary.
    #[error("block fetch failed: {0}")]
    BlockFetch(String),

    /// Failed to write block data at a channel boundary.
    #[error("block write failed: {0}")]
    BlockWrite(String),

    /// Edge carries a communication pattern the channel factory cannot build.
    #[error("unsupported communication pattern: {0}")]
    UnsupportedCommPattern(String),

    /// A message arrived at a listener that does not handle its type.
    #[error("illegal message: {0}")]
    IllegalMessage(String),

    /// A control request was not answered within the caller-supplied deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unrecoverable failures.
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl CascadeError {
    /// Returns whether this error is recoverable at task-group granularity.
    ///
    /// Recoverable errors are converted into task state transitions by the
    /// task-group executor; everything else terminates the task group.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CascadeError::AbsentPartition { .. }
                | CascadeError::BlockFetch(_)
                | CascadeError::BlockWrite(_)
                | CascadeError::DeadlineExceeded(_)
        )
    }
}

/// Standard cascade result alias.
pub type Result<T> = std::result::Result<T, CascadeError>;
