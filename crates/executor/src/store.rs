//! Block stores backing runtime edges.
//!
//! A partition is stored as a list of blocks, each holding the records of one
//! hash bucket. Readers restrict themselves to a hash range; writers hand
//! back per-block metadata for commit and skew metrics. Backends provide
//! their own internal synchronization.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use tracing::debug;

use cascade_common::{BlockMetadata, CascadeError, HashRange, Result};

use crate::coder::{Coder, Record};

const INDEX_BIN_MAGIC: &[u8; 4] = b"CSDI";
const INDEX_BIN_VERSION: u32 = 1;
const INDEX_BIN_HEADER_LEN: usize = 12;

/// One decoded block: the records of a single hash bucket.
#[derive(Debug, Clone)]
pub struct Block {
    /// Hash key shared by the block's records.
    pub key: u32,
    /// The block's records.
    pub records: Vec<Record>,
}

impl Block {
    /// Builds a block from a bucket key and its records.
    pub fn new(key: u32, records: Vec<Record>) -> Self {
        Self { key, records }
    }
}

/// A backend storing partitions as lists of blocks.
pub trait BlockStore: Send + Sync {
    /// Writes the blocks of a partition, returning per-block metadata in
    /// block order.
    fn write(
        &self,
        partition_id: &str,
        blocks: Vec<Block>,
        coder: &dyn Coder,
    ) -> Result<Vec<BlockMetadata>>;

    /// Reads every record whose block key falls in `range`.
    fn read(&self, partition_id: &str, range: &HashRange, coder: &dyn Coder)
        -> Result<Vec<Record>>;

    /// Returns whether the partition exists in this store.
    fn contains(&self, partition_id: &str) -> bool;

    /// Removes the partition; returns whether it existed.
    fn remove(&self, partition_id: &str) -> Result<bool>;
}

/// Process-local store of decoded records.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Vec<Block>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryStore {
    fn write(
        &self,
        partition_id: &str,
        blocks: Vec<Block>,
        _coder: &dyn Coder,
    ) -> Result<Vec<BlockMetadata>> {
        let mut metadata = Vec::with_capacity(blocks.len());
        let mut offset = 0_u64;
        for block in &blocks {
            let len: u64 = block.records.iter().map(|r| r.payload.len() as u64).sum();
            metadata.push(BlockMetadata {
                key: block.key,
                len_bytes: len,
                offset,
                element_count: block.records.len() as u64,
            });
            offset += len;
        }
        let mut partitions = self.partitions.write().expect("memory store lock poisoned");
        partitions
            .entry(partition_id.to_string())
            .or_default()
            .extend(blocks);
        Ok(metadata)
    }

    fn read(
        &self,
        partition_id: &str,
        range: &HashRange,
        _coder: &dyn Coder,
    ) -> Result<Vec<Record>> {
        let partitions = self.partitions.read().expect("memory store lock poisoned");
        let blocks = partitions.get(partition_id).ok_or_else(|| {
            CascadeError::BlockFetch(format!("partition '{partition_id}' not in memory store"))
        })?;
        Ok(blocks
            .iter()
            .filter(|block| range.includes(block.key))
            .flat_map(|block| block.records.iter().cloned())
            .collect())
    }

    fn contains(&self, partition_id: &str) -> bool {
        self.partitions
            .read()
            .expect("memory store lock poisoned")
            .contains_key(partition_id)
    }

    fn remove(&self, partition_id: &str) -> Result<bool> {
        Ok(self
            .partitions
            .write()
            .expect("memory store lock poisoned")
            .remove(partition_id)
            .is_some())
    }
}

struct SerializedBlock {
    key: u32,
    bytes: Bytes,
    element_count: u64,
}

/// Process-local store of coder-encoded block bytes.
#[derive(Default)]
pub struct SerializedMemoryStore {
    partitions: RwLock<HashMap<String, Vec<SerializedBlock>>>,
}

impl SerializedMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for SerializedMemoryStore {
    fn write(
        &self,
        partition_id: &str,
        blocks: Vec<Block>,
        coder: &dyn Coder,
    ) -> Result<Vec<BlockMetadata>> {
        let mut metadata = Vec::with_capacity(blocks.len());
        let mut serialized = Vec::with_capacity(blocks.len());
        let mut offset = 0_u64;
        for block in blocks {
            let bytes = coder.encode(&block.records)?;
            metadata.push(BlockMetadata {
                key: block.key,
                len_bytes: bytes.len() as u64,
                offset,
                element_count: block.records.len() as u64,
            });
            offset += bytes.len() as u64;
            serialized.push(SerializedBlock {
                key: block.key,
                bytes,
                element_count: block.records.len() as u64,
            });
        }
        let mut partitions = self
            .partitions
            .write()
            .expect("serialized store lock poisoned");
        partitions
            .entry(partition_id.to_string())
            .or_default()
            .extend(serialized);
        Ok(metadata)
    }

    fn read(
        &self,
        partition_id: &str,
        range: &HashRange,
        coder: &dyn Coder,
    ) -> Result<Vec<Record>> {
        let partitions = self
            .partitions
            .read()
            .expect("serialized store lock poisoned");
        let blocks = partitions.get(partition_id).ok_or_else(|| {
            CascadeError::BlockFetch(format!(
                "partition '{partition_id}' not in serialized memory store"
            ))
        })?;
        let mut records = Vec::new();
        for block in blocks.iter().filter(|b| range.includes(b.key)) {
            let decoded = coder.decode(&block.bytes)?;
            debug_assert_eq!(decoded.len() as u64, block.element_count);
            records.extend(decoded);
        }
        Ok(records)
    }

    fn contains(&self, partition_id: &str) -> bool {
        self.partitions
            .read()
            .expect("serialized store lock poisoned")
            .contains_key(partition_id)
    }

    fn remove(&self, partition_id: &str) -> Result<bool> {
        Ok(self
            .partitions
            .write()
            .expect("serialized store lock poisoned")
            .remove(partition_id)
            .is_some())
    }
}

/// File-backed store: one data file of concatenated encoded blocks plus a
/// JSON index and a magic-prefixed binary index per partition.
///
/// With an executor-local root this is the local-file store; with a shared
/// root it is the remote-file store.
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    fn partition_dir(&self, partition_id: &str) -> PathBuf {
        self.root_dir.join("partition").join(partition_id)
    }

    fn data_path(&self, partition_id: &str) -> PathBuf {
        self.partition_dir(partition_id).join("blocks.bin")
    }

    fn index_json_path(&self, partition_id: &str) -> PathBuf {
        self.partition_dir(partition_id).join("index.json")
    }

    fn index_bin_path(&self, partition_id: &str) -> PathBuf {
        self.partition_dir(partition_id).join("index.bin")
    }

    fn write_index(&self, partition_id: &str, index: &[BlockMetadata]) -> Result<()> {
        let json_bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| CascadeError::BlockWrite(format!("index json encode failed: {e}")))?;
        fs::write(self.index_json_path(partition_id), &json_bytes).map_err(write_err)?;

        let mut out = Vec::with_capacity(INDEX_BIN_HEADER_LEN + json_bytes.len());
        out.extend_from_slice(INDEX_BIN_MAGIC);
        out.extend_from_slice(&INDEX_BIN_VERSION.to_le_bytes());
        out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&json_bytes);
        fs::write(self.index_bin_path(partition_id), out).map_err(write_err)?;
        Ok(())
    }

    fn read_index(&self, partition_id: &str) -> Result<Vec<BlockMetadata>> {
        let bin = self.index_bin_path(partition_id);
        if bin.exists() {
            let bytes = fs::read(bin).map_err(fetch_err)?;
            return decode_index_binary(&bytes);
        }
        let bytes = fs::read(self.index_json_path(partition_id)).map_err(fetch_err)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CascadeError::BlockFetch(format!("index json decode failed: {e}")))
    }
}

fn fetch_err(e: std::io::Error) -> CascadeError {
    CascadeError::BlockFetch(e.to_string())
}

fn write_err(e: std::io::Error) -> CascadeError {
    CascadeError::BlockWrite(e.to_string())
}

fn decode_index_binary(bytes: &[u8]) -> Result<Vec<BlockMetadata>> {
    if bytes.len() < INDEX_BIN_HEADER_LEN {
        return Err(CascadeError::BlockFetch(
            "index.bin is too small to contain header".to_string(),
        ));
    }
    if &bytes[0..4] != INDEX_BIN_MAGIC {
        return Err(CascadeError::BlockFetch("invalid index.bin magic".to_string()));
    }
    let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if bytes.len() < INDEX_BIN_HEADER_LEN + len {
        return Err(CascadeError::BlockFetch(
            "index.bin payload length is invalid".to_string(),
        ));
    }
    let payload = &bytes[INDEX_BIN_HEADER_LEN..INDEX_BIN_HEADER_LEN + len];
    serde_json::from_slice(payload)
        .map_err(|e| CascadeError::BlockFetch(format!("index.bin decode failed: {e}")))
}

impl BlockStore for FileStore {
    fn write(
        &self,
        partition_id: &str,
        blocks: Vec<Block>,
        coder: &dyn Coder,
    ) -> Result<Vec<BlockMetadata>> {
        let dir = self.partition_dir(partition_id);
        fs::create_dir_all(&dir).map_err(write_err)?;

        let mut metadata = Vec::with_capacity(blocks.len());
        let mut data = Vec::new();
        for block in &blocks {
            let bytes = coder.encode(&block.records)?;
            metadata.push(BlockMetadata {
                key: block.key,
                len_bytes: bytes.len() as u64,
                offset: data.len() as u64,
                element_count: block.records.len() as u64,
            });
            data.extend_from_slice(&bytes);
        }
        fs::write(self.data_path(partition_id), &data).map_err(write_err)?;
        self.write_index(partition_id, &metadata)?;
        debug!(
            partition_id = %partition_id,
            blocks = metadata.len(),
            bytes = data.len(),
            "partition written to file store"
        );
        Ok(metadata)
    }

    fn read(
        &self,
        partition_id: &str,
        range: &HashRange,
        coder: &dyn Coder,
    ) -> Result<Vec<Record>> {
        let index = self.read_index(partition_id)?;
        let data = fs::read(self.data_path(partition_id)).map_err(fetch_err)?;
        let mut records = Vec::new();
        for block in index.iter().filter(|b| range.includes(b.key)) {
            let start = block.offset as usize;
            let end = start + block.len_bytes as usize;
            let slice = data.get(start..end).ok_or_else(|| {
                CascadeError::BlockFetch(format!(
                    "block [{start}, {end}) is out of bounds for partition '{partition_id}'"
                ))
            })?;
            records.extend(coder.decode(slice)?);
        }
        Ok(records)
    }

    fn contains(&self, partition_id: &str) -> bool {
        // The binary index is written last, so its presence means the data
        // file and JSON index are complete.
        self.index_bin_path(partition_id).exists()
    }

    fn remove(&self, partition_id: &str) -> Result<bool> {
        let dir = self.partition_dir(partition_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }
}

/// Creates a file store rooted at `root`, ensuring the directory exists.
pub fn file_store_at(root: &Path) -> Result<FileStore> {
    fs::create_dir_all(root)?;
    Ok(FileStore::new(root))
}
