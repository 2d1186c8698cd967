//! Cluster-wide partition registry on the master.
//!
//! Locking:
//! - the partition map and the producer reverse index live under one
//!   read/write lock;
//! - single-partition updates take the read lock, because each
//!   [`PartitionMetadata`] is sufficiently synchronized on its own;
//! - operations that touch multiple partitions or change the map shape
//!   (initialize, producer scheduled/failed, remove-worker) take the write
//!   lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use cascade_common::{BlockMetadata, CascadeError, PartitionState, Result};

use crate::partition_metadata::{LocationFuture, PartitionMetadata};

#[derive(Default)]
struct Maps {
    partitions: HashMap<String, Arc<PartitionMetadata>>,
    producer_to_partitions: HashMap<String, HashSet<String>>,
}

/// Master-side partition manager: tracks every partition's lifecycle, serves
/// location queries, and drives recovery when workers fail.
#[derive(Default)]
pub struct PartitionManagerMaster {
    maps: RwLock<Maps>,
}

impl PartitionManagerMaster {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the state of a partition its producer task group will
    /// produce, and records the producer in the reverse index.
    pub fn initialize_state(&self, partition_id: &str, producer_task_group_id: &str) {
        let mut maps = self.maps.write().expect("partition maps lock poisoned");
        if maps
            .partitions
            .insert(
                partition_id.to_string(),
                Arc::new(PartitionMetadata::new(partition_id)),
            )
            .is_some()
        {
            warn!(
                partition_id = %partition_id,
                "partition metadata was re-initialized"
            );
        }
        maps.producer_to_partitions
            .entry(producer_task_group_id.to_string())
            .or_default()
            .insert(partition_id.to_string());
    }

    /// To be called when a potential producer task group is enqueued for
    /// scheduling: every partition it produces moves to `SCHEDULED`.
    pub fn on_producer_task_group_scheduled(&self, task_group_id: &str) {
        let maps = self.maps.write().expect("partition maps lock poisoned");
        let Some(partition_ids) = maps.producer_to_partitions.get(task_group_id) else {
            // This task group does not produce any partition.
            return;
        };
        for partition_id in partition_ids {
            let Some(metadata) = maps.partitions.get(partition_id) else {
                continue;
            };
            if metadata.state() != PartitionState::Scheduled {
                if let Err(e) = metadata.on_state_changed(PartitionState::Scheduled, None) {
                    warn!(
                        partition_id = %partition_id,
                        error = %e,
                        "dropping invalid schedule transition"
                    );
                }
            }
        }
    }

    /// To be called when a producer task group fails: committed partitions
    /// become `LOST`, scheduled ones `LOST_BEFORE_COMMIT`.
    pub fn on_producer_task_group_failed(&self, task_group_id: &str) {
        let maps = self.maps.write().expect("partition maps lock poisoned");
        let Some(partition_ids) = maps.producer_to_partitions.get(task_group_id) else {
            return;
        };
        info!(
            task_group_id = %task_group_id,
            partitions = partition_ids.len(),
            "producer task group failed; invalidating its partitions"
        );
        for partition_id in partition_ids {
            let Some(metadata) = maps.partitions.get(partition_id) else {
                continue;
            };
            let target = match metadata.state() {
                PartitionState::Committed => PartitionState::Lost,
                PartitionState::Scheduled => PartitionState::LostBeforeCommit,
                other => {
                    debug!(
                        partition_id = %partition_id,
                        state = %other,
                        "partition untouched by producer failure"
                    );
                    continue;
                }
            };
            if let Err(e) = metadata.on_state_changed(target, None) {
                warn!(
                    partition_id = %partition_id,
                    error = %e,
                    "dropping invalid failure transition"
                );
            }
        }
    }

    /// Deals with a state change of a single partition; delegated to its
    /// metadata under the shared read lock.
    pub fn on_partition_state_changed(
        &self,
        partition_id: &str,
        new_state: PartitionState,
        location: Option<&str>,
    ) -> Result<()> {
        let metadata = self.metadata(partition_id)?;
        metadata.on_state_changed(new_state, location)
    }

    /// Returns the location future of a partition.
    ///
    /// While the partition is `SCHEDULED` the future is pending and resolves
    /// on commit; in any non-servable state a pre-failed future carrying
    /// `AbsentPartition(state)` is returned.
    pub fn get_partition_location_future(&self, partition_id: &str) -> Result<LocationFuture> {
        let metadata = self.metadata(partition_id)?;
        let state = metadata.state();
        if state.is_servable() {
            Ok(metadata.location_future())
        } else {
            Ok(LocationFuture::absent(partition_id, state))
        }
    }

    /// The ids of the task groups which already produced or will produce a
    /// partition.
    pub fn get_producer_task_group_ids(&self, partition_id: &str) -> HashSet<String> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.producer_to_partitions
            .iter()
            .filter(|(_, partitions)| partitions.contains(partition_id))
            .map(|(task_group_id, _)| task_group_id.clone())
            .collect()
    }

    /// Partitions currently committed at the given executor.
    pub fn get_committed_partitions_by_worker(&self, executor_id: &str) -> Vec<String> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.partitions
            .values()
            .filter(|metadata| {
                metadata.state() == PartitionState::Committed
                    && metadata.location().as_deref() == Some(executor_id)
            })
            .map(|metadata| metadata.partition_id().to_string())
            .collect()
    }

    /// Current state of a partition, if it is known.
    pub fn get_partition_state(&self, partition_id: &str) -> Option<PartitionState> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.partitions.get(partition_id).map(|m| m.state())
    }

    /// Handles the loss of an executor: every partition committed there
    /// becomes `LOST`, and the producer task groups of those partitions are
    /// returned as the recomputation request for the scheduler.
    ///
    /// In-flight `SCHEDULED` partitions are left to their producer task
    /// group, which fails separately as its executor is gone.
    pub fn remove_worker(&self, executor_id: &str) -> HashSet<String> {
        warn!(executor_id = %executor_id, "worker removed");
        let mut task_groups_to_recompute = HashSet::new();
        let maps = self.maps.write().expect("partition maps lock poisoned");

        let lost: Vec<&Arc<PartitionMetadata>> = maps
            .partitions
            .values()
            .filter(|metadata| {
                metadata.state() == PartitionState::Committed
                    && metadata.location().as_deref() == Some(executor_id)
            })
            .collect();
        for metadata in lost {
            if let Err(e) = metadata.on_state_changed(PartitionState::Lost, None) {
                warn!(
                    partition_id = %metadata.partition_id(),
                    error = %e,
                    "dropping invalid loss transition"
                );
                continue;
            }
            for (task_group_id, partitions) in &maps.producer_to_partitions {
                if partitions.contains(metadata.partition_id()) {
                    task_groups_to_recompute.insert(task_group_id.clone());
                }
            }
        }
        task_groups_to_recompute
    }

    /// Reserves a block slot in a remote partition's metadata; returns the
    /// byte position to write at and the block index.
    pub fn reserve_block(&self, partition_id: &str, block: BlockMetadata) -> Result<(u64, u32)> {
        self.metadata(partition_id)?.reserve_block(block)
    }

    /// Commits reserved block indices; idempotent per index.
    pub fn commit_blocks(&self, partition_id: &str, indices: &[u32]) -> Result<()> {
        self.metadata(partition_id)?.commit_blocks(indices)
    }

    /// Indices of every block reserved so far in a partition.
    pub fn reserved_block_indices(&self, partition_id: &str) -> Result<Vec<u32>> {
        Ok(self.metadata(partition_id)?.reserved_block_indices())
    }

    /// The committed block metadata of a partition.
    pub fn block_metadata(&self, partition_id: &str) -> Result<Vec<BlockMetadata>> {
        Ok(self.metadata(partition_id)?.block_metadata())
    }

    /// Clears a partition's block index on explicit removal.
    pub fn remove_block_metadata(&self, partition_id: &str) -> Result<()> {
        self.metadata(partition_id)?.remove_block_metadata();
        Ok(())
    }

    /// All initialized partition ids; the union of the reverse index values
    /// always equals this set.
    pub fn initialized_partition_ids(&self) -> HashSet<String> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.partitions.keys().cloned().collect()
    }

    /// The reverse index entry for one producer task group.
    pub fn partitions_of_producer(&self, task_group_id: &str) -> HashSet<String> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.producer_to_partitions
            .get(task_group_id)
            .cloned()
            .unwrap_or_default()
    }

    fn metadata(&self, partition_id: &str) -> Result<Arc<PartitionMetadata>> {
        let maps = self.maps.read().expect("partition maps lock poisoned");
        maps.partitions.get(partition_id).cloned().ok_or_else(|| {
            CascadeError::Unknown(format!("unknown partition: {partition_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_producer(partitions: &[&str], producer: &str) -> PartitionManagerMaster {
        let manager = PartitionManagerMaster::new();
        for partition_id in partitions {
            manager.initialize_state(partition_id, producer);
        }
        manager
    }

    #[test]
    fn reverse_index_matches_initialized_partitions() {
        let manager = manager_with_producer(&["e0#0", "e0#1"], "TG-s0-0");
        manager.initialize_state("e1#0", "TG-s1-0");

        let mut union: HashSet<String> = manager.partitions_of_producer("TG-s0-0");
        union.extend(manager.partitions_of_producer("TG-s1-0"));
        assert_eq!(union, manager.initialized_partition_ids());
    }

    #[test]
    fn producer_scheduling_moves_partitions_to_scheduled() {
        let manager = manager_with_producer(&["e0#0", "e0#1"], "TG-s0-0");
        manager.on_producer_task_group_scheduled("TG-s0-0");
        assert_eq!(
            manager.get_partition_state("e0#0"),
            Some(PartitionState::Scheduled)
        );
        assert_eq!(
            manager.get_partition_state("e0#1"),
            Some(PartitionState::Scheduled)
        );
        // Scheduling an unknown producer is a no-op.
        manager.on_producer_task_group_scheduled("TG-unknown");
    }

    #[test]
    fn producer_failure_splits_by_commit_status() {
        let manager = manager_with_producer(&["e0#0", "e0#1"], "TG-s0-0");
        manager.on_producer_task_group_scheduled("TG-s0-0");
        manager
            .on_partition_state_changed("e0#0", PartitionState::Committed, Some("exec-1"))
            .expect("commit");

        manager.on_producer_task_group_failed("TG-s0-0");
        assert_eq!(
            manager.get_partition_state("e0#0"),
            Some(PartitionState::Lost)
        );
        assert_eq!(
            manager.get_partition_state("e0#1"),
            Some(PartitionState::LostBeforeCommit)
        );
    }

    #[tokio::test]
    async fn absent_partition_future_carries_the_observed_state() {
        let manager = manager_with_producer(&["e0#0"], "TG-s0-0");
        let future = manager
            .get_partition_location_future("e0#0")
            .expect("future");
        let err = future.resolve().await.expect_err("ready is not servable");
        match err {
            CascadeError::AbsentPartition { state, .. } => {
                assert_eq!(state, PartitionState::Ready)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remove_worker_collects_only_committed_producers() {
        let manager = PartitionManagerMaster::new();
        manager.initialize_state("e0#0", "TG-a");
        manager.initialize_state("e0#1", "TG-b");
        manager.initialize_state("e0#2", "TG-c");
        for task_group in ["TG-a", "TG-b", "TG-c"] {
            manager.on_producer_task_group_scheduled(task_group);
        }
        manager
            .on_partition_state_changed("e0#0", PartitionState::Committed, Some("X"))
            .expect("commit p1");
        manager
            .on_partition_state_changed("e0#1", PartitionState::Committed, Some("X"))
            .expect("commit p2");
        // e0#2 stays SCHEDULED at X.

        let recompute = manager.remove_worker("X");
        assert_eq!(
            recompute,
            ["TG-a", "TG-b"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            manager.get_partition_state("e0#0"),
            Some(PartitionState::Lost)
        );
        assert_eq!(
            manager.get_partition_state("e0#1"),
            Some(PartitionState::Lost)
        );
        assert_eq!(
            manager.get_partition_state("e0#2"),
            Some(PartitionState::Scheduled)
        );
    }

    #[test]
    fn redelivered_commit_is_idempotent() {
        let manager = manager_with_producer(&["e0#0"], "TG-a");
        manager.on_producer_task_group_scheduled("TG-a");
        manager
            .on_partition_state_changed("e0#0", PartitionState::Committed, Some("exec-1"))
            .expect("commit");
        manager
            .on_partition_state_changed("e0#0", PartitionState::Committed, Some("exec-1"))
            .expect("duplicate commit is a no-op");
        assert_eq!(
            manager.get_partition_state("e0#0"),
            Some(PartitionState::Committed)
        );
    }
}
