//! Element records and the coders that serialize them on edges.
//!
//! The runtime is agnostic to element contents: a record is a partition-key
//! hash plus coder-encoded payload bytes, and each edge names the coder that
//! turns record batches into block bytes and back. The registry is
//! append-only and safe for concurrent reads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use cascade_common::{CascadeError, Result};

/// One data element on a runtime edge: its partition-key hash and the
/// edge-coder-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Hash of the element key, used for block bucketing and hash ranges.
    pub key: u32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Record {
    /// Builds a record from a key hash and payload bytes.
    pub fn new(key: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// Serializes record batches to block bytes and back.
pub trait Coder: Send + Sync {
    /// Encodes the records into one contiguous byte buffer.
    fn encode(&self, records: &[Record]) -> Result<Bytes>;

    /// Decodes a byte buffer produced by [`Coder::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>>;
}

/// Default coder: `[u32 key][u32 len][payload]` per record, big-endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedCoder;

/// Registry id of [`LengthPrefixedCoder`].
pub const LENGTH_PREFIXED_CODER_ID: &str = "length-prefixed";

impl Coder for LengthPrefixedCoder {
    fn encode(&self, records: &[Record]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            records.iter().map(|r| 8 + r.payload.len()).sum::<usize>(),
        );
        for record in records {
            buf.put_u32(record.key);
            let len = u32::try_from(record.payload.len()).map_err(|_| {
                CascadeError::BlockWrite("record payload exceeds u32 length".to_string())
            })?;
            buf.put_u32(len);
            buf.put_slice(&record.payload);
        }
        Ok(buf.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>> {
        let mut buf = bytes;
        let mut records = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                return Err(CascadeError::BlockFetch(
                    "truncated record header".to_string(),
                ));
            }
            let key = buf.get_u32();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(CascadeError::BlockFetch(
                    "truncated record payload".to_string(),
                ));
            }
            let mut payload = vec![0_u8; len];
            buf.copy_to_slice(&mut payload);
            records.push(Record { key, payload });
        }
        Ok(records)
    }
}

/// Append-only registry of coders by id.
#[derive(Default)]
pub struct CoderRegistry {
    coders: RwLock<HashMap<String, Arc<dyn Coder>>>,
}

impl CoderRegistry {
    /// Creates a registry pre-populated with the default coder.
    pub fn with_defaults() -> Arc<Self> {
        let registry = Arc::new(Self::default());
        registry.register(LENGTH_PREFIXED_CODER_ID, Arc::new(LengthPrefixedCoder));
        registry
    }

    /// Registers a coder under `coder_id`. The first registration wins.
    pub fn register(&self, coder_id: &str, coder: Arc<dyn Coder>) {
        let mut coders = self.coders.write().expect("coder registry lock poisoned");
        coders.entry(coder_id.to_string()).or_insert(coder);
    }

    /// Looks a coder up by id.
    pub fn get(&self, coder_id: &str) -> Result<Arc<dyn Coder>> {
        let coders = self.coders.read().expect("coder registry lock poisoned");
        coders
            .get(coder_id)
            .cloned()
            .ok_or_else(|| CascadeError::Unknown(format!("no coder registered as '{coder_id}'")))
    }
}

/// Edge-id to coder mapping built as task groups arrive on an executor.
#[derive(Default)]
pub struct CoderManager {
    registry: Arc<CoderRegistry>,
    edge_coders: RwLock<HashMap<String, Arc<dyn Coder>>>,
}

impl CoderManager {
    /// Creates a manager resolving coder ids through `registry`.
    pub fn new(registry: Arc<CoderRegistry>) -> Self {
        Self {
            registry,
            edge_coders: RwLock::new(HashMap::new()),
        }
    }

    /// Binds `edge_id` to the coder registered as `coder_id`.
    pub fn register_edge(&self, edge_id: &str, coder_id: &str) -> Result<()> {
        let coder = self.registry.get(coder_id)?;
        let mut edge_coders = self.edge_coders.write().expect("coder manager lock poisoned");
        edge_coders.entry(edge_id.to_string()).or_insert(coder);
        Ok(())
    }

    /// The coder bound to `edge_id`.
    pub fn coder_for_edge(&self, edge_id: &str) -> Result<Arc<dyn Coder>> {
        let edge_coders = self.edge_coders.read().expect("coder manager lock poisoned");
        edge_coders
            .get(edge_id)
            .cloned()
            .ok_or_else(|| CascadeError::Unknown(format!("no coder bound to edge '{edge_id}'")))
    }
}
