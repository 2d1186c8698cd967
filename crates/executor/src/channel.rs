//! Data channel construction for task inputs and outputs.
//!
//! Selection logic per edge:
//! - one-to-one: a single partition `edge#srcIndex` with `srcIndex` equal to
//!   the destination task index; the reader returns exactly one future;
//! - broadcast: one future per source index, full hash range;
//! - shuffle: one future per source index, restricted to the hash range
//!   assigned to the destination task group;
//! - intra-stage edges use an in-process edge store (valid because task
//!   execution is topological within a group).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};

use cascade_common::ids;
use cascade_common::{
    CascadeError, CommunicationPattern, HashRange, Result, RuntimeEdge, StageEdge,
};

use crate::coder::Record;
use crate::partition_worker::PartitionManagerWorker;
use crate::store::Block;

/// In-process store for stage-internal edges of one task group instance.
#[derive(Default)]
pub struct LocalEdgeStore {
    edges: Mutex<HashMap<String, Vec<Record>>>,
}

impl LocalEdgeStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn put(&self, edge_id: &str, records: Vec<Record>) {
        self.edges
            .lock()
            .expect("local edge lock poisoned")
            .insert(edge_id.to_string(), records);
    }

    fn take(&self, edge_id: &str) -> Result<Vec<Record>> {
        self.edges
            .lock()
            .expect("local edge lock poisoned")
            .remove(edge_id)
            .ok_or_else(|| {
                CascadeError::BlockFetch(format!(
                    "intra-stage edge '{edge_id}' has no data; writer did not run"
                ))
            })
    }
}

enum ReaderKind {
    Stage(StageEdge),
    Local(RuntimeEdge),
}

/// The input data transfer to one task.
pub struct InputReader {
    dst_task_index: u32,
    task_group_id: String,
    src_vertex_id: String,
    kind: ReaderKind,
    worker: Arc<PartitionManagerWorker>,
    local_edges: Arc<LocalEdgeStore>,
}

impl InputReader {
    /// Id of the runtime edge this reader consumes.
    pub fn edge_id(&self) -> &str {
        match &self.kind {
            ReaderKind::Stage(edge) => &edge.edge_id,
            ReaderKind::Local(edge) => &edge.edge_id,
        }
    }

    /// Id of the vertex producing this input.
    pub fn src_vertex_id(&self) -> &str {
        &self.src_vertex_id
    }

    /// Whether this edge is a side input.
    pub fn is_side_input(&self) -> bool {
        match &self.kind {
            ReaderKind::Stage(edge) => edge.properties.side_input,
            ReaderKind::Local(edge) => edge.properties.side_input,
        }
    }

    /// The parallelism of the source: 1 for one-to-one and local edges,
    /// otherwise the source vertex parallelism.
    pub fn source_parallelism(&self) -> u32 {
        match &self.kind {
            ReaderKind::Local(_) => 1,
            ReaderKind::Stage(edge) => match edge.properties.communication_pattern {
                CommunicationPattern::OneToOne => 1,
                CommunicationPattern::Broadcast | CommunicationPattern::Shuffle => {
                    edge.src_parallelism
                }
            },
        }
    }

    /// Issues the reads for this input, one future per source partition.
    pub fn read(&self) -> Result<Vec<BoxFuture<'static, Result<Vec<Record>>>>> {
        match &self.kind {
            ReaderKind::Local(edge) => {
                let result = self.local_edges.take(&edge.edge_id);
                Ok(vec![async move { result }.boxed()])
            }
            ReaderKind::Stage(edge) => match edge.properties.communication_pattern {
                CommunicationPattern::OneToOne => Ok(vec![self.retrieve_future(
                    edge,
                    self.dst_task_index,
                    HashRange::all(),
                )]),
                CommunicationPattern::Broadcast => Ok((0..edge.src_parallelism)
                    .map(|src_index| self.retrieve_future(edge, src_index, HashRange::all()))
                    .collect()),
                CommunicationPattern::Shuffle => {
                    let range = edge
                        .task_group_to_hash_range
                        .get(&self.task_group_id)
                        .copied()
                        .ok_or_else(|| {
                            CascadeError::BlockFetch(format!(
                                "no hash range assigned to task group '{}' on edge '{}'",
                                self.task_group_id, edge.edge_id
                            ))
                        })?;
                    Ok((0..edge.src_parallelism)
                        .map(|src_index| self.retrieve_future(edge, src_index, range))
                        .collect())
                }
            },
        }
    }

    /// Awaits and concatenates all reads; used for side inputs, which must be
    /// fully materialized before per-element processing begins.
    pub async fn side_input(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for future in self.read()? {
            records.extend(future.await?);
        }
        Ok(records)
    }

    fn retrieve_future(
        &self,
        edge: &StageEdge,
        src_index: u32,
        range: HashRange,
    ) -> BoxFuture<'static, Result<Vec<Record>>> {
        let worker = Arc::clone(&self.worker);
        let partition_id = ids::partition_id(&edge.edge_id, src_index);
        let edge_id = edge.edge_id.clone();
        let data_store = edge.properties.data_store;
        async move {
            worker
                .retrieve(&partition_id, &edge_id, data_store, range)
                .await
        }
        .boxed()
    }
}

enum WriterKind {
    Stage(StageEdge),
    Local(RuntimeEdge),
}

/// The output data transfer from one task.
///
/// Records are buffered across `write` calls; `close` buckets them into
/// blocks, hands them to the partition store, and commits the partition.
pub struct OutputWriter {
    src_task_index: u32,
    src_vertex_id: String,
    kind: WriterKind,
    worker: Arc<PartitionManagerWorker>,
    local_edges: Arc<LocalEdgeStore>,
    buffer: Vec<Record>,
    closed: bool,
}

impl OutputWriter {
    /// Id of the runtime edge this writer produces.
    pub fn edge_id(&self) -> &str {
        match &self.kind {
            WriterKind::Stage(edge) => &edge.edge_id,
            WriterKind::Local(edge) => &edge.edge_id,
        }
    }

    /// Buffers records for the partition this task produces.
    pub fn write(&mut self, records: Vec<Record>) -> Result<()> {
        if self.closed {
            return Err(CascadeError::BlockWrite(format!(
                "write after close on edge '{}'",
                self.edge_id()
            )));
        }
        self.buffer.extend(records);
        Ok(())
    }

    /// Flushes buffered records and commits the partition.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let records = std::mem::take(&mut self.buffer);

        match &self.kind {
            WriterKind::Local(edge) => {
                self.local_edges.put(&edge.edge_id, records);
                Ok(())
            }
            WriterKind::Stage(edge) => {
                let partition_id = ids::partition_id(&edge.edge_id, self.src_task_index);
                let bucket_count = match edge.properties.communication_pattern {
                    CommunicationPattern::Shuffle => edge.properties.shuffle_bucket_count.max(1),
                    CommunicationPattern::OneToOne | CommunicationPattern::Broadcast => 1,
                };
                let blocks = bucket_records(records, bucket_count);
                match edge.properties.communication_pattern {
                    CommunicationPattern::Shuffle => {
                        self.worker
                            .data_skew_write(
                                &partition_id,
                                &edge.edge_id,
                                edge.properties.data_store,
                                blocks,
                                &self.src_vertex_id,
                                bucket_count,
                            )
                            .await?;
                    }
                    CommunicationPattern::OneToOne | CommunicationPattern::Broadcast => {
                        self.worker
                            .write_partition(
                                &partition_id,
                                &edge.edge_id,
                                edge.properties.data_store,
                                blocks,
                            )
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn bucket_records(records: Vec<Record>, bucket_count: u32) -> Vec<Block> {
    let mut buckets: BTreeMap<u32, Vec<Record>> = BTreeMap::new();
    for record in records {
        let key = record.key % bucket_count;
        buckets.entry(key).or_default().push(record);
    }
    buckets
        .into_iter()
        .map(|(key, records)| Block::new(key, records))
        .collect()
}

/// Constructs input readers and output writers for cross-stage and
/// intra-stage edges.
pub struct DataChannelFactory {
    worker: Arc<PartitionManagerWorker>,
}

impl DataChannelFactory {
    /// Builds a factory over the executor's partition manager.
    pub fn new(worker: Arc<PartitionManagerWorker>) -> Self {
        Self { worker }
    }

    /// Reader for a cross-stage edge arriving at one destination task.
    pub fn create_reader(
        &self,
        dst_task_index: u32,
        task_group_id: &str,
        edge: &StageEdge,
        local_edges: Arc<LocalEdgeStore>,
    ) -> InputReader {
        InputReader {
            dst_task_index,
            task_group_id: task_group_id.to_string(),
            src_vertex_id: edge.src_vertex_id.clone(),
            kind: ReaderKind::Stage(edge.clone()),
            worker: Arc::clone(&self.worker),
            local_edges,
        }
    }

    /// Writer for a cross-stage edge leaving one source task.
    pub fn create_writer(
        &self,
        src_task_index: u32,
        src_vertex_id: &str,
        edge: &StageEdge,
        local_edges: Arc<LocalEdgeStore>,
    ) -> OutputWriter {
        OutputWriter {
            src_task_index,
            src_vertex_id: src_vertex_id.to_string(),
            kind: WriterKind::Stage(edge.clone()),
            worker: Arc::clone(&self.worker),
            local_edges,
            buffer: Vec::new(),
            closed: false,
        }
    }

    /// Reader for a stage-internal edge.
    ///
    /// Intra-stage edges are in-process queues between exactly one producer
    /// and one consumer; only one-to-one communication is meaningful there.
    pub fn create_local_reader(
        &self,
        task_group_id: &str,
        src_vertex_id: &str,
        edge: &RuntimeEdge,
        local_edges: Arc<LocalEdgeStore>,
    ) -> Result<InputReader> {
        if edge.properties.communication_pattern != CommunicationPattern::OneToOne {
            return Err(CascadeError::UnsupportedCommPattern(format!(
                "intra-stage edge '{}' declares {:?}",
                edge.edge_id, edge.properties.communication_pattern
            )));
        }
        Ok(InputReader {
            dst_task_index: 0,
            task_group_id: task_group_id.to_string(),
            src_vertex_id: src_vertex_id.to_string(),
            kind: ReaderKind::Local(edge.clone()),
            worker: Arc::clone(&self.worker),
            local_edges,
        })
    }

    /// Writer for a stage-internal edge.
    pub fn create_local_writer(
        &self,
        src_vertex_id: &str,
        edge: &RuntimeEdge,
        local_edges: Arc<LocalEdgeStore>,
    ) -> Result<OutputWriter> {
        if edge.properties.communication_pattern != CommunicationPattern::OneToOne {
            return Err(CascadeError::UnsupportedCommPattern(format!(
                "intra-stage edge '{}' declares {:?}",
                edge.edge_id, edge.properties.communication_pattern
            )));
        }
        Ok(OutputWriter {
            src_task_index: 0,
            src_vertex_id: src_vertex_id.to_string(),
            kind: WriterKind::Local(edge.clone()),
            worker: Arc::clone(&self.worker),
            local_edges,
            buffer: Vec::new(),
            closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketing_groups_by_key_modulo() {
        let records = vec![
            Record::new(0, b"a".to_vec()),
            Record::new(5, b"b".to_vec()),
            Record::new(2, b"c".to_vec()),
            Record::new(4, b"d".to_vec()),
        ];
        let blocks = bucket_records(records, 4);
        let keys: Vec<u32> = blocks.iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![0, 1, 2]);
        // 0 and 4 share bucket 0; 5 lands in bucket 1.
        assert_eq!(blocks[0].records.len(), 2);
        assert_eq!(blocks[1].records.len(), 1);
    }

    #[test]
    fn local_edge_store_is_take_once() {
        let store = LocalEdgeStore::new();
        store.put("e-local", vec![Record::new(0, b"x".to_vec())]);
        assert_eq!(store.take("e-local").expect("take").len(), 1);
        assert!(store.take("e-local").is_err());
    }
}
