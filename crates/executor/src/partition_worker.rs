//! Worker-side partition read/write façade.
//!
//! Reads consult the local stores first and fall back to asking the master
//! for the owner location; the master parks the reply until the partition
//! commits, so a read against a `SCHEDULED` partition simply waits. Reads
//! from another live executor travel over the block transfer framing; reads
//! of committed remote-store partitions go straight to the shared root.
//!
//! Writes publish partition state transitions back to the master; skew-aware
//! writes additionally reserve block slots (remote stores) and report
//! per-bucket sizes for the skew optimizer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cascade_common::ids::REMOTE_LOCATION;
use cascade_common::{
    BlockMetadata, CascadeError, DataStore, HashRange, PartitionState, Result, RuntimeConfig,
};
use cascade_message::{Message, MessageSender, Payload, RUNTIME_MASTER_LISTENER_ID};

use crate::block_transfer::{BlockTransferEndpoint, TransferHandler};
use crate::coder::{CoderManager, Record};
use crate::store::{file_store_at, Block, BlockStore, FileStore, MemoryStore, SerializedMemoryStore};

const PULL_OK: u8 = 0;
const PULL_ERR: u8 = 1;

/// Descriptor of one cross-executor block pull.
#[derive(Debug, Serialize, Deserialize)]
struct BlockPullRequest {
    partition_id: String,
    edge_id: String,
    data_store: DataStore,
    hash_range: HashRange,
}

/// Worker-side partition manager over the four block stores.
pub struct PartitionManagerWorker {
    executor_id: String,
    coder_manager: Arc<CoderManager>,
    memory: MemoryStore,
    serialized_memory: SerializedMemoryStore,
    local_file: FileStore,
    remote_file: FileStore,
    master: MessageSender,
    peers: Mutex<HashMap<String, Arc<BlockTransferEndpoint>>>,
}

impl PartitionManagerWorker {
    /// Creates the façade for one executor.
    pub fn new(
        executor_id: impl Into<String>,
        coder_manager: Arc<CoderManager>,
        config: &RuntimeConfig,
        master: MessageSender,
    ) -> Result<Arc<Self>> {
        let executor_id = executor_id.into();
        let local_file = file_store_at(&config.local_store_root.join(&executor_id))?;
        let remote_file = file_store_at(&config.remote_store_root)?;
        Ok(Arc::new(Self {
            executor_id,
            coder_manager,
            memory: MemoryStore::new(),
            serialized_memory: SerializedMemoryStore::new(),
            local_file,
            remote_file,
            master,
            peers: Mutex::new(HashMap::new()),
        }))
    }

    /// Id of the owning executor.
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Registers the transfer endpoint toward a peer executor.
    pub fn connect_peer(&self, peer_executor_id: &str, endpoint: Arc<BlockTransferEndpoint>) {
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .insert(peer_executor_id.to_string(), endpoint);
    }

    fn store(&self, data_store: DataStore) -> &dyn BlockStore {
        match data_store {
            DataStore::Memory => &self.memory,
            DataStore::SerializedMemory => &self.serialized_memory,
            DataStore::LocalFile => &self.local_file,
            DataStore::RemoteFile => &self.remote_file,
        }
    }

    /// Retrieves the records of `partition_id` restricted to `hash_range`,
    /// consulting the master for the location on a local miss.
    pub async fn retrieve(
        &self,
        partition_id: &str,
        edge_id: &str,
        data_store: DataStore,
        hash_range: HashRange,
    ) -> Result<Vec<Record>> {
        let coder = self.coder_manager.coder_for_edge(edge_id)?;
        let store = self.store(data_store);
        if store.contains(partition_id) {
            return store.read(partition_id, &hash_range, coder.as_ref());
        }

        let request = Message::new(
            RUNTIME_MASTER_LISTENER_ID,
            Payload::RequestBlockLocation {
                executor_id: self.executor_id.clone(),
                block_id: partition_id.to_string(),
            },
        );
        let reply = self.master.request(request).await?;
        let (state, owner) = match reply.payload {
            Payload::BlockLocationInfo {
                state,
                owner_executor_id,
                ..
            } => (state, owner_executor_id),
            other => {
                return Err(CascadeError::IllegalMessage(format!(
                    "unexpected reply to a location request: {}",
                    other.tag()
                )))
            }
        };

        match (owner, state) {
            (Some(owner), _) if owner == self.executor_id => {
                store.read(partition_id, &hash_range, coder.as_ref())
            }
            (Some(owner), _) if owner == REMOTE_LOCATION => {
                self.remote_file
                    .read(partition_id, &hash_range, coder.as_ref())
            }
            (Some(owner), _) => {
                self.pull_from_peer(&owner, partition_id, edge_id, data_store, hash_range)
                    .await
            }
            (None, Some(state)) => Err(CascadeError::AbsentPartition {
                partition_id: partition_id.to_string(),
                state,
            }),
            (None, None) => Err(CascadeError::BlockFetch(format!(
                "no location known for partition '{partition_id}'"
            ))),
        }
    }

    async fn pull_from_peer(
        &self,
        owner: &str,
        partition_id: &str,
        edge_id: &str,
        data_store: DataStore,
        hash_range: HashRange,
    ) -> Result<Vec<Record>> {
        let endpoint = self
            .peers
            .lock()
            .expect("peer lock poisoned")
            .get(owner)
            .cloned()
            .ok_or_else(|| {
                CascadeError::BlockFetch(format!(
                    "no transfer channel to executor '{owner}' for partition '{partition_id}'"
                ))
            })?;
        let descriptor = serde_json::to_vec(&BlockPullRequest {
            partition_id: partition_id.to_string(),
            edge_id: edge_id.to_string(),
            data_store,
            hash_range,
        })
        .map_err(|e| CascadeError::BlockFetch(format!("pull descriptor encode failed: {e}")))?;

        debug!(
            partition_id = %partition_id,
            owner = %owner,
            "pulling partition from peer executor"
        );
        let response = endpoint.pull(Bytes::from(descriptor)).await?;
        let (status, body) = response.split_first().ok_or_else(|| {
            CascadeError::BlockFetch("empty pull response".to_string())
        })?;
        if *status != PULL_OK {
            return Err(CascadeError::BlockFetch(format!(
                "peer '{owner}' failed to serve partition '{partition_id}': {}",
                String::from_utf8_lossy(body)
            )));
        }
        let coder = self.coder_manager.coder_for_edge(edge_id)?;
        coder.decode(body)
    }

    /// Writes the blocks of a partition and commits it with the master.
    pub async fn write_partition(
        &self,
        partition_id: &str,
        edge_id: &str,
        data_store: DataStore,
        blocks: Vec<Block>,
    ) -> Result<Vec<BlockMetadata>> {
        let coder = self.coder_manager.coder_for_edge(edge_id)?;
        let metadata = self
            .store(data_store)
            .write(partition_id, blocks, coder.as_ref())?;
        self.commit(partition_id, data_store)?;
        Ok(metadata)
    }

    /// Skew-aware write: reserves block slots for remote stores, writes the
    /// blocks, reports per-bucket sizes, and commits.
    pub async fn data_skew_write(
        &self,
        partition_id: &str,
        edge_id: &str,
        data_store: DataStore,
        blocks: Vec<Block>,
        src_vertex_id: &str,
        bucket_count: u32,
    ) -> Result<Vec<BlockMetadata>> {
        let coder = self.coder_manager.coder_for_edge(edge_id)?;

        if data_store.is_remote() {
            for block in &blocks {
                let encoded_len = coder.encode(&block.records)?.len() as u64;
                self.reserve_block(
                    partition_id,
                    BlockMetadata::new(block.key, encoded_len, block.records.len() as u64),
                )
                .await?;
            }
        }

        let metadata = self
            .store(data_store)
            .write(partition_id, blocks, coder.as_ref())?;

        let mut partition_sizes = vec![0_u64; bucket_count.max(1) as usize];
        for block in &metadata {
            if let Some(size) = partition_sizes.get_mut(block.key as usize) {
                *size += block.len_bytes;
            }
        }
        self.master.send(Message::new(
            RUNTIME_MASTER_LISTENER_ID,
            Payload::DataSizeMetric {
                partition_sizes,
                block_id: partition_id.to_string(),
                src_vertex_id: src_vertex_id.to_string(),
            },
        ))?;

        self.commit(partition_id, data_store)?;
        Ok(metadata)
    }

    async fn reserve_block(&self, partition_id: &str, block: BlockMetadata) -> Result<(u64, u32)> {
        let reply = self
            .master
            .request(Message::new(
                RUNTIME_MASTER_LISTENER_ID,
                Payload::ReservePartition {
                    executor_id: self.executor_id.clone(),
                    block_id: partition_id.to_string(),
                    block_metadata: block,
                },
            ))
            .await?;
        match reply.payload {
            Payload::ReservePartitionResponse {
                position_to_write: Some(position),
                partition_index: Some(index),
                ..
            } => Ok((position, index)),
            Payload::ReservePartitionResponse { .. } => Err(CascadeError::BlockWrite(format!(
                "block reservation rejected for partition '{partition_id}'"
            ))),
            other => Err(CascadeError::IllegalMessage(format!(
                "unexpected reply to a reservation: {}",
                other.tag()
            ))),
        }
    }

    fn commit(&self, partition_id: &str, data_store: DataStore) -> Result<()> {
        let location = if data_store.is_remote() {
            REMOTE_LOCATION.to_string()
        } else {
            self.executor_id.clone()
        };
        self.master.send(Message::new(
            RUNTIME_MASTER_LISTENER_ID,
            Payload::BlockStateChanged {
                executor_id: self.executor_id.clone(),
                block_id: partition_id.to_string(),
                state: PartitionState::Committed,
                location: Some(location),
            },
        ))
    }

    /// Removes a partition from its store, for explicit removal requests.
    pub fn remove_partition(&self, partition_id: &str, data_store: DataStore) -> Result<bool> {
        let removed = self.store(data_store).remove(partition_id)?;
        if !removed {
            warn!(
                partition_id = %partition_id,
                "removal requested for a partition this executor does not hold"
            );
        }
        Ok(removed)
    }
}

/// Serves peers' block pulls out of this executor's stores.
pub struct BlockPullServer {
    worker: Arc<PartitionManagerWorker>,
}

impl BlockPullServer {
    /// Wraps a worker partition manager for serving.
    pub fn new(worker: Arc<PartitionManagerWorker>) -> Arc<Self> {
        Arc::new(Self { worker })
    }
}

#[async_trait::async_trait]
impl TransferHandler for BlockPullServer {
    async fn on_pull(&self, request: Bytes) -> Result<Bytes> {
        let descriptor: BlockPullRequest = serde_json::from_slice(&request)
            .map_err(|e| CascadeError::BlockFetch(format!("pull descriptor decode failed: {e}")))?;

        let served: Result<Bytes> = (|| {
            let coder = self
                .worker
                .coder_manager
                .coder_for_edge(&descriptor.edge_id)?;
            let records = self.worker.store(descriptor.data_store).read(
                &descriptor.partition_id,
                &descriptor.hash_range,
                coder.as_ref(),
            )?;
            coder.encode(&records)
        })();

        let mut response = BytesMut::new();
        match served {
            Ok(bytes) => {
                response.put_u8(PULL_OK);
                response.extend_from_slice(&bytes);
            }
            Err(e) => {
                warn!(
                    partition_id = %descriptor.partition_id,
                    error = %e,
                    "failed to serve a block pull"
                );
                response.put_u8(PULL_ERR);
                response.extend_from_slice(e.to_string().as_bytes());
            }
        }
        Ok(response.freeze())
    }
}
