//! Runtime identifier construction and parsing.
//!
//! Identifiers are opaque strings, dense and unique within a job:
//! `<edgeId>#<producerTaskIndex>` for partitions, `TG-<stage>-<index>` for
//! task groups, and monotonically increasing numeric ids for control
//! messages.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CascadeError, Result};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Sentinel owner location for partitions kept in remote (shared) stores.
pub const REMOTE_LOCATION: &str = "REMOTE";

/// Builds the id of the partition produced on `edge_id` by the source task
/// with index `producer_task_index`.
pub fn partition_id(edge_id: &str, producer_task_index: u32) -> String {
    format!("{edge_id}#{producer_task_index}")
}

/// Splits a partition id back into `(edge_id, producer_task_index)`.
pub fn split_partition_id(partition_id: &str) -> Result<(&str, u32)> {
    let (edge, index) = partition_id
        .rsplit_once('#')
        .ok_or_else(|| CascadeError::Unknown(format!("malformed partition id: {partition_id}")))?;
    let index = index
        .parse::<u32>()
        .map_err(|e| CascadeError::Unknown(format!("malformed partition index: {e}")))?;
    Ok((edge, index))
}

/// Builds a task group id from its stage and index within the stage.
pub fn task_group_id(stage_id: &str, task_group_index: u32) -> String {
    format!("TG-{stage_id}-{task_group_index}")
}

/// Builds a task id from its runtime vertex and the owning task group.
pub fn task_id(runtime_vertex_id: &str, task_group_id: &str) -> String {
    format!("Task-{runtime_vertex_id}-{task_group_id}")
}

/// Returns the next process-unique control message id.
pub fn generate_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}
