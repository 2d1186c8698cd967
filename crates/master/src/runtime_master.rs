//! The `runtime-master` control listener.
//!
//! Responsibilities:
//! - apply executor-reported block state transitions to the partition manager;
//! - serve block location requests, parking the reply until the location
//!   future resolves;
//! - deduplicate task-group state reports by `(task group, attempt, state)`
//!   and forward fresh ones to the scheduler contract;
//! - turn executor/container failures into recomputation requests;
//! - retain the latest per-bucket data sizes for the skew optimizer.
//!
//! State-machine violations are logged and the offending update dropped; they
//! never bring the master down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use cascade_common::ids::REMOTE_LOCATION;
use cascade_common::states::{RecoverableFailureCause, TaskGroupState};
use cascade_message::{Message, MessageContext, MessageListener, Payload};

use crate::partition_manager::PartitionManagerMaster;

/// The contract the external scheduler must satisfy.
///
/// The scheduling policy itself lives outside the runtime core; the master
/// only notifies it of task-group progress and asks for recomputation after
/// worker loss.
#[async_trait]
pub trait SchedulerContract: Send + Sync {
    /// Observes one deduplicated task-group state transition.
    async fn on_task_group_state_changed(
        &self,
        executor_id: &str,
        task_group_id: &str,
        state: TaskGroupState,
        attempt_index: u32,
        tasks_on_hold: Vec<String>,
        failure_cause: Option<RecoverableFailureCause>,
    );

    /// Requests recomputation of the given task groups after data loss.
    async fn on_recompute_requested(&self, task_group_ids: HashSet<String>);
}

/// Master-side runtime wiring control messages to the partition manager and
/// the scheduler contract.
pub struct RuntimeMaster {
    partition_manager: Arc<PartitionManagerMaster>,
    scheduler: Arc<dyn SchedulerContract>,
    seen_reports: Mutex<HashSet<(String, u32, TaskGroupState)>>,
    data_sizes: Mutex<HashMap<String, Vec<u64>>>,
}

impl RuntimeMaster {
    /// Builds the master over a partition manager and a scheduler contract.
    pub fn new(
        partition_manager: Arc<PartitionManagerMaster>,
        scheduler: Arc<dyn SchedulerContract>,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition_manager,
            scheduler,
            seen_reports: Mutex::new(HashSet::new()),
            data_sizes: Mutex::new(HashMap::new()),
        })
    }

    /// The partition manager this master fronts.
    pub fn partition_manager(&self) -> &Arc<PartitionManagerMaster> {
        &self.partition_manager
    }

    /// Latest reported per-bucket sizes for a partition, for the external
    /// skew optimizer.
    pub fn data_sizes_of(&self, block_id: &str) -> Option<Vec<u64>> {
        self.data_sizes
            .lock()
            .expect("data size lock poisoned")
            .get(block_id)
            .cloned()
    }

    async fn handle_task_group_state_changed(
        &self,
        executor_id: String,
        task_group_id: String,
        state: TaskGroupState,
        tasks_on_hold: Vec<String>,
        failure_cause: Option<RecoverableFailureCause>,
        attempt_index: u32,
    ) {
        let fresh = self
            .seen_reports
            .lock()
            .expect("report lock poisoned")
            .insert((task_group_id.clone(), attempt_index, state));
        if !fresh {
            debug!(
                task_group_id = %task_group_id,
                attempt_index,
                state = %state,
                "ignoring re-delivered task group state report"
            );
            return;
        }

        info!(
            executor_id = %executor_id,
            task_group_id = %task_group_id,
            state = %state,
            attempt_index,
            operator = "RuntimeMaster",
            "task group state changed"
        );
        if matches!(
            state,
            TaskGroupState::FailedRecoverable | TaskGroupState::FailedUnrecoverable
        ) {
            self.partition_manager
                .on_producer_task_group_failed(&task_group_id);
        }
        self.scheduler
            .on_task_group_state_changed(
                &executor_id,
                &task_group_id,
                state,
                attempt_index,
                tasks_on_hold,
                failure_cause,
            )
            .await;
    }

    async fn handle_worker_loss(&self, executor_id: &str) {
        let to_recompute = self.partition_manager.remove_worker(executor_id);
        if !to_recompute.is_empty() {
            self.scheduler.on_recompute_requested(to_recompute).await;
        }
    }
}

#[async_trait]
impl MessageListener for RuntimeMaster {
    async fn on_message(&self, message: Message) {
        match message.payload {
            Payload::TaskGroupStateChanged {
                executor_id,
                task_group_id,
                state,
                tasks_on_hold,
                failure_cause,
                attempt_index,
            } => {
                self.handle_task_group_state_changed(
                    executor_id,
                    task_group_id,
                    state,
                    tasks_on_hold,
                    failure_cause,
                    attempt_index,
                )
                .await;
            }
            Payload::BlockStateChanged {
                block_id,
                state,
                location,
                ..
            } => {
                // Remote commits finalize their reserved block index while
                // the partition is still SCHEDULED.
                if state == cascade_common::PartitionState::Committed
                    && location.as_deref() == Some(REMOTE_LOCATION)
                {
                    let indices = self
                        .partition_manager
                        .reserved_block_indices(&block_id)
                        .unwrap_or_default();
                    if !indices.is_empty() {
                        if let Err(e) = self.partition_manager.commit_blocks(&block_id, &indices) {
                            error!(
                                block_id = %block_id,
                                error = %e,
                                "dropping invalid remote block commit"
                            );
                        }
                    }
                }
                if let Err(e) = self.partition_manager.on_partition_state_changed(
                    &block_id,
                    state,
                    location.as_deref(),
                ) {
                    error!(
                        block_id = %block_id,
                        state = %state,
                        error = %e,
                        "dropping invalid block state update"
                    );
                }
            }
            Payload::DataSizeMetric {
                partition_sizes,
                block_id,
                src_vertex_id,
            } => {
                debug!(
                    block_id = %block_id,
                    src_vertex_id = %src_vertex_id,
                    buckets = partition_sizes.len(),
                    "data size metric recorded"
                );
                self.data_sizes
                    .lock()
                    .expect("data size lock poisoned")
                    .insert(block_id, partition_sizes);
            }
            Payload::ExecutorFailed {
                executor_id,
                exception,
            } => {
                warn!(
                    executor_id = %executor_id,
                    error = %String::from_utf8_lossy(&exception),
                    "executor failed"
                );
                self.handle_worker_loss(&executor_id).await;
            }
            Payload::ContainerFailed { executor_id } => {
                self.handle_worker_loss(&executor_id).await;
            }
            other => {
                error!(
                    message_type = other.tag(),
                    "illegal message received by runtime master"
                );
            }
        }
    }

    async fn on_message_with_context(&self, message: Message, context: MessageContext) {
        match message.payload {
            Payload::RequestBlockLocation { block_id, .. } => {
                let request_id = message.id;
                match self.partition_manager.get_partition_location_future(&block_id) {
                    Ok(future) => {
                        // The reply is parked until the location resolves, so
                        // a SCHEDULED partition answers as soon as it commits.
                        tokio::spawn(async move {
                            let reply = match future.resolve().await {
                                Ok(owner) => Payload::BlockLocationInfo {
                                    request_id,
                                    block_id,
                                    state: None,
                                    owner_executor_id: Some(owner),
                                },
                                Err(cascade_common::CascadeError::AbsentPartition {
                                    state,
                                    ..
                                }) => Payload::BlockLocationInfo {
                                    request_id,
                                    block_id,
                                    state: Some(state),
                                    owner_executor_id: None,
                                },
                                Err(_) => Payload::BlockLocationInfo {
                                    request_id,
                                    block_id,
                                    state: None,
                                    owner_executor_id: None,
                                },
                            };
                            let reply_to = context.sender_id().to_string();
                            context.reply(Message::new(reply_to, reply));
                        });
                    }
                    Err(e) => {
                        warn!(block_id = %block_id, error = %e, "location request for unknown partition");
                        let reply_to = context.sender_id().to_string();
                        context.reply(Message::new(
                            reply_to,
                            Payload::BlockLocationInfo {
                                request_id,
                                block_id,
                                state: None,
                                owner_executor_id: None,
                            },
                        ));
                    }
                }
            }
            Payload::ReservePartition {
                block_id,
                block_metadata,
                ..
            } => {
                let request_id = message.id;
                let reply = match self
                    .partition_manager
                    .reserve_block(&block_id, block_metadata)
                {
                    Ok((position_to_write, partition_index)) => Payload::ReservePartitionResponse {
                        request_id,
                        position_to_write: Some(position_to_write),
                        partition_index: Some(partition_index),
                    },
                    Err(e) => {
                        error!(block_id = %block_id, error = %e, "block reservation rejected");
                        Payload::ReservePartitionResponse {
                            request_id,
                            position_to_write: None,
                            partition_index: None,
                        }
                    }
                };
                let reply_to = context.sender_id().to_string();
                context.reply(Message::new(reply_to, reply));
            }
            other => {
                error!(
                    message_type = other.tag(),
                    "illegal request received by runtime master"
                );
            }
        }
    }
}
