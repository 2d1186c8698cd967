//! Per-partition state machine, location future, and block index.
//!
//! Each partition owns its own lock, so single-partition updates are safe
//! under the manager's shared read lock. The location future resolves on the
//! first transition to `COMMITTED` and completes with failure on transitions
//! that make the partition unservable; re-entry into `SCHEDULED` creates a
//! fresh future so readers can retry after recomputation.

use std::sync::Mutex;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tracing::debug;

use cascade_common::{BlockMetadata, CascadeError, PartitionState, Result};

/// Why a location future completed without a location.
#[derive(Debug, Clone)]
pub struct AbsentLocation {
    /// Partition the query was about.
    pub partition_id: String,
    /// Partition state at completion time.
    pub state: PartitionState,
}

impl From<AbsentLocation> for CascadeError {
    fn from(absent: AbsentLocation) -> Self {
        CascadeError::AbsentPartition {
            partition_id: absent.partition_id,
            state: absent.state,
        }
    }
}

type LocationResult = std::result::Result<String, AbsentLocation>;

/// A multi-waiter future for a partition's owner location.
#[derive(Clone)]
pub struct LocationFuture {
    shared: Shared<oneshot::Receiver<LocationResult>>,
}

impl LocationFuture {
    fn pending() -> (oneshot::Sender<LocationResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                shared: rx.shared(),
            },
        )
    }

    /// A future pre-completed with `AbsentPartition(state)`.
    pub fn absent(partition_id: impl Into<String>, state: PartitionState) -> Self {
        let (tx, future) = Self::pending();
        let _ = tx.send(Err(AbsentLocation {
            partition_id: partition_id.into(),
            state,
        }));
        future
    }

    /// Awaits the location; fails with `AbsentPartition` when the partition
    /// became unservable before committing.
    pub async fn resolve(self) -> Result<String> {
        match self.shared.await {
            Ok(Ok(location)) => Ok(location),
            Ok(Err(absent)) => Err(absent.into()),
            Err(_) => Err(CascadeError::Unknown(
                "partition metadata dropped while a location was awaited".to_string(),
            )),
        }
    }

    /// Returns the location if the future already resolved successfully.
    pub fn peek_committed(&self) -> Option<String> {
        match self.shared.clone().now_or_never() {
            Some(Ok(Ok(location))) => Some(location),
            _ => None,
        }
    }
}

struct BlockSlot {
    metadata: BlockMetadata,
    committed: bool,
}

struct MetadataInner {
    state: PartitionState,
    location: Option<String>,
    completer: Option<oneshot::Sender<LocationResult>>,
    future: LocationFuture,
    blocks: Vec<BlockSlot>,
    next_offset: u64,
}

/// Master-side metadata of one partition.
pub struct PartitionMetadata {
    partition_id: String,
    inner: Mutex<MetadataInner>,
}

impl PartitionMetadata {
    /// Creates metadata in `READY` with a pending location future.
    pub fn new(partition_id: impl Into<String>) -> Self {
        let (tx, future) = LocationFuture::pending();
        Self {
            partition_id: partition_id.into(),
            inner: Mutex::new(MetadataInner {
                state: PartitionState::Ready,
                location: None,
                completer: Some(tx),
                future,
                blocks: Vec::new(),
                next_offset: 0,
            }),
        }
    }

    /// Id of the tracked partition.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Current state.
    pub fn state(&self) -> PartitionState {
        self.inner.lock().expect("partition lock poisoned").state
    }

    /// Current owner location, present iff `COMMITTED` or `SCHEDULED` with an
    /// assigned executor.
    pub fn location(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("partition lock poisoned")
            .location
            .clone()
    }

    /// The current location future.
    pub fn location_future(&self) -> LocationFuture {
        self.inner
            .lock()
            .expect("partition lock poisoned")
            .future
            .clone()
    }

    /// Runs the state transition function.
    ///
    /// Re-delivery of a commit from the same location is a no-op; a commit
    /// from a different location means two producers and is a protocol error.
    /// Any other transition outside the state DAG is rejected for the caller
    /// to log and drop.
    pub fn on_state_changed(
        &self,
        new_state: PartitionState,
        location: Option<&str>,
    ) -> Result<()> {
        let completion = {
            let mut inner = self.inner.lock().expect("partition lock poisoned");
            let current = inner.state;

            if current == PartitionState::Committed && new_state == PartitionState::Committed {
                return if inner.location.as_deref() == location {
                    Ok(())
                } else {
                    Err(CascadeError::IllegalMessage(format!(
                        "partition '{}' committed twice with different locations ({:?} then {:?})",
                        self.partition_id, inner.location, location
                    )))
                };
            }

            if !current.can_transition_to(new_state) {
                return Err(CascadeError::IllegalMessage(format!(
                    "partition '{}' cannot transition {current} -> {new_state}",
                    self.partition_id
                )));
            }

            debug!(
                partition_id = %self.partition_id,
                from = %current,
                to = %new_state,
                "partition state changed"
            );

            match new_state {
                PartitionState::Scheduled => {
                    // A fresh future after the previous attempt's future was
                    // completed exceptionally; the initial READY future stays.
                    if inner.completer.is_none() {
                        let (tx, future) = LocationFuture::pending();
                        inner.completer = Some(tx);
                        inner.future = future;
                    }
                    inner.location = location.map(str::to_string);
                    inner.state = new_state;
                    None
                }
                PartitionState::Committed => {
                    let owner = location.map(str::to_string).ok_or_else(|| {
                        CascadeError::IllegalMessage(format!(
                            "partition '{}' committed without a location",
                            self.partition_id
                        ))
                    })?;
                    inner.location = Some(owner.clone());
                    inner.state = new_state;
                    inner.completer.take().map(|tx| (tx, Ok(owner)))
                }
                PartitionState::Lost
                | PartitionState::LostBeforeCommit
                | PartitionState::Removed => {
                    inner.location = None;
                    inner.state = new_state;
                    inner.completer.take().map(|tx| {
                        (
                            tx,
                            Err(AbsentLocation {
                                partition_id: self.partition_id.clone(),
                                state: new_state,
                            }),
                        )
                    })
                }
                PartitionState::Ready => {
                    inner.location = None;
                    inner.state = new_state;
                    None
                }
            }
        };

        // Waiters are woken outside the partition lock.
        if let Some((tx, result)) = completion {
            let _ = tx.send(result);
        }
        Ok(())
    }

    /// Reserves a block slot and returns `(position_to_write, block_index)`.
    ///
    /// Only legal while `SCHEDULED`; remote writers reserve before writing so
    /// concurrent producers of different blocks never overlap.
    pub fn reserve_block(&self, mut block: BlockMetadata) -> Result<(u64, u32)> {
        let mut inner = self.inner.lock().expect("partition lock poisoned");
        if inner.state != PartitionState::Scheduled {
            return Err(CascadeError::IllegalMessage(format!(
                "partition '{}' cannot reserve blocks in state {}",
                self.partition_id, inner.state
            )));
        }
        let position = inner.next_offset;
        block.offset = position;
        inner.next_offset += block.len_bytes;
        inner.blocks.push(BlockSlot {
            metadata: block,
            committed: false,
        });
        Ok((position, (inner.blocks.len() - 1) as u32))
    }

    /// Marks the given block indices committed; idempotent per index.
    pub fn commit_blocks(&self, indices: &[u32]) -> Result<()> {
        let mut inner = self.inner.lock().expect("partition lock poisoned");
        if inner.state != PartitionState::Scheduled {
            return Err(CascadeError::IllegalMessage(format!(
                "partition '{}' cannot commit blocks in state {}",
                self.partition_id, inner.state
            )));
        }
        for &index in indices {
            let slot = inner.blocks.get_mut(index as usize).ok_or_else(|| {
                CascadeError::IllegalMessage(format!(
                    "partition '{}' has no reserved block at index {index}",
                    self.partition_id
                ))
            })?;
            slot.committed = true;
        }
        Ok(())
    }

    /// Indices of every reserved block, committed or not.
    pub fn reserved_block_indices(&self) -> Vec<u32> {
        let inner = self.inner.lock().expect("partition lock poisoned");
        (0..inner.blocks.len() as u32).collect()
    }

    /// The committed block metadata entries, in reservation order.
    pub fn block_metadata(&self) -> Vec<BlockMetadata> {
        let inner = self.inner.lock().expect("partition lock poisoned");
        inner
            .blocks
            .iter()
            .filter(|slot| slot.committed)
            .map(|slot| slot.metadata.clone())
            .collect()
    }

    /// Clears the block index; used on removal.
    pub fn remove_block_metadata(&self) {
        let mut inner = self.inner.lock().expect("partition lock poisoned");
        inner.blocks.clear();
        inner.next_offset = 0;
    }
}
