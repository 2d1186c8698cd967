//! Executor entry: receives scheduled task groups and runs them on a
//! capacity-bounded pool.
//!
//! Responsibilities:
//! - listen on the reserved `executor` listener id;
//! - register edge coders before execution;
//! - run each task group under one capacity permit;
//! - report `ExecutorFailed` with a serialized error payload when an
//!   unrecoverable error escapes a task group.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use cascade_common::states::TaskGroupState;
use cascade_common::{Result, RuntimeConfig, ScheduledTaskGroup, StageEdge};
use cascade_message::{
    Message, MessageContext, MessageEnvironment, MessageListener, MessageSender, Payload,
    EXECUTOR_LISTENER_ID, RUNTIME_MASTER_LISTENER_ID,
};

use crate::channel::DataChannelFactory;
use crate::coder::{CoderManager, CoderRegistry};
use crate::partition_worker::PartitionManagerWorker;
use crate::state_manager::TaskGroupStateManager;
use crate::task_group_executor::TaskGroupExecutor;
use crate::transform::{SourceRegistry, TransformRegistry};

/// One worker process: a task-group pool over a partition manager.
#[derive(Clone)]
pub struct Executor {
    executor_id: String,
    capacity: Arc<Semaphore>,
    master: MessageSender,
    worker: Arc<PartitionManagerWorker>,
    coder_manager: Arc<CoderManager>,
    transforms: Arc<TransformRegistry>,
    sources: Arc<SourceRegistry>,
    data_queue_capacity: usize,
}

impl Executor {
    /// Starts an executor in `env`, listening for scheduled task groups.
    ///
    /// `master_env_id` names the environment hosting the runtime master.
    pub fn start(
        config: &RuntimeConfig,
        env: &MessageEnvironment,
        master_env_id: &str,
        coder_registry: Arc<CoderRegistry>,
        transforms: Arc<TransformRegistry>,
        sources: Arc<SourceRegistry>,
    ) -> Result<Arc<Self>> {
        let master = env.get_sender(master_env_id, RUNTIME_MASTER_LISTENER_ID)?;
        let coder_manager = Arc::new(CoderManager::new(coder_registry));
        let worker = PartitionManagerWorker::new(
            env.id(),
            Arc::clone(&coder_manager),
            config,
            master.clone(),
        )?;
        let executor = Arc::new(Self {
            executor_id: env.id().to_string(),
            capacity: Arc::new(Semaphore::new(config.executor_capacity.max(1))),
            master,
            worker,
            coder_manager,
            transforms,
            sources,
            data_queue_capacity: config.data_queue_capacity,
        });
        env.setup_listener(EXECUTOR_LISTENER_ID, executor.clone());
        Ok(executor)
    }

    /// Id of this executor.
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// The worker-side partition manager, for wiring transfer peers.
    pub fn partition_worker(&self) -> Arc<PartitionManagerWorker> {
        Arc::clone(&self.worker)
    }

    fn register_edge_coders(&self, edges: &[StageEdge]) -> Result<()> {
        for edge in edges {
            self.coder_manager
                .register_edge(&edge.edge_id, &edge.properties.coder_id)?;
        }
        Ok(())
    }

    async fn launch_task_group(&self, scheduled: ScheduledTaskGroup) {
        let mut state_manager = TaskGroupStateManager::new(
            &scheduled.task_group,
            scheduled.attempt_index,
            self.executor_id.clone(),
            self.master.clone(),
        );
        state_manager.on_task_group_state_changed(TaskGroupState::Ready, Vec::new(), None);

        let wired = self
            .register_edge_coders(&scheduled.incoming_edges)
            .and_then(|_| self.register_edge_coders(&scheduled.outgoing_edges))
            .and_then(|_| {
                for edge in &scheduled.task_group.task_dag.edges {
                    self.coder_manager
                        .register_edge(&edge.edge_id, &edge.properties.coder_id)?;
                }
                Ok(())
            });

        let run = match wired {
            Err(e) => Err(e),
            Ok(()) => {
                let channel_factory = DataChannelFactory::new(Arc::clone(&self.worker));
                match TaskGroupExecutor::new(
                    scheduled,
                    state_manager,
                    &channel_factory,
                    Arc::clone(&self.transforms),
                    Arc::clone(&self.sources),
                    self.data_queue_capacity,
                ) {
                    Ok(mut executor) => executor.execute().await,
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = run {
            error!(
                executor_id = %self.executor_id,
                error = %e,
                "task group escaped with an unrecoverable error"
            );
            let _ = self.master.send(Message::new(
                RUNTIME_MASTER_LISTENER_ID,
                Payload::ExecutorFailed {
                    executor_id: self.executor_id.clone(),
                    exception: e.to_string().into_bytes(),
                },
            ));
        }
    }
}

#[async_trait]
impl MessageListener for Executor {
    async fn on_message(&self, message: Message) {
        match message.payload {
            Payload::ScheduleTaskGroup { task_group } => {
                let scheduled = match ScheduledTaskGroup::from_bytes(&task_group) {
                    Ok(scheduled) => scheduled,
                    Err(e) => {
                        error!(
                            executor_id = %self.executor_id,
                            error = %e,
                            "dropping undecodable task group descriptor"
                        );
                        return;
                    }
                };
                debug!(
                    executor_id = %self.executor_id,
                    task_group_id = %scheduled.task_group.task_group_id,
                    attempt_index = scheduled.attempt_index,
                    "task group received"
                );
                // One capacity permit per task group; excess groups queue.
                let this = self.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = this.capacity.clone().acquire_owned().await else {
                        return;
                    };
                    this.launch_task_group(scheduled).await;
                });
            }
            other => {
                error!(
                    executor_id = %self.executor_id,
                    message_type = other.tag(),
                    "illegal message received by executor"
                );
            }
        }
    }

    async fn on_message_with_context(&self, message: Message, _context: MessageContext) {
        error!(
            executor_id = %self.executor_id,
            message_type = message.payload.tag(),
            "illegal request received by executor"
        );
    }
}
