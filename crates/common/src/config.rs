use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime behavior/configuration knobs shared by master and executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Max concurrently executing task groups per executor.
    pub executor_capacity: usize,
    /// Deadline for control requests awaiting a reply, in milliseconds.
    pub request_timeout_ms: u64,
    /// Root directory for executor-local file stores.
    pub local_store_root: PathBuf,
    /// Shared root directory for remote file stores.
    pub remote_store_root: PathBuf,
    /// Chunk size for block transfer frame bodies, in bytes.
    pub transfer_chunk_bytes: usize,
    /// Bound of the per-operator-task data queue, in pending reads.
    pub data_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor_capacity: 2,
            request_timeout_ms: 10_000,
            local_store_root: PathBuf::from(".cascade_local"),
            remote_store_root: PathBuf::from(".cascade_remote"),
            transfer_chunk_bytes: 64 * 1024,
            data_queue_capacity: 64,
        }
    }
}
