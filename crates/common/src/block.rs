//! Per-block metadata inside a partition.

use serde::{Deserialize, Serialize};

/// Metadata for one block: a contiguous group of elements sharing a hash key
/// within a hash-partitioned output.
///
/// Offsets are assigned at reservation/commit time; a committed partition has
/// a frozen list of these entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Hash key shared by every element in the block.
    pub key: u32,
    /// Encoded length of the block in bytes.
    pub len_bytes: u64,
    /// Byte offset of the block within the partition file/buffer.
    pub offset: u64,
    /// Number of elements in the block.
    pub element_count: u64,
}

impl BlockMetadata {
    /// Creates metadata with the offset left for reservation to assign.
    pub fn new(key: u32, len_bytes: u64, element_count: u64) -> Self {
        Self {
            key,
            len_bytes,
            offset: 0,
            element_count,
        }
    }
}
