//! Executes a topologically ordered micro-DAG of tasks within a task group.
//!
//! Responsibilities:
//! - wire input readers and output writers for every task up front;
//! - walk the task DAG in topological order, dispatching on task variant;
//! - pump asynchronous reads through a bounded data queue, consuming exactly
//!   one pair per outstanding read future;
//! - convert recoverable I/O errors into task state transitions; anything
//!   else terminates the task group and propagates.
//!
//! `execute` runs exactly once per instance; re-entry is a protocol error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use cascade_common::states::{RecoverableFailureCause, TaskGroupState, TaskState};
use cascade_common::{
    BoundedSourceTask, CascadeError, MetricCollectionBarrierTask, OperatorTask, Result,
    ScheduledTaskGroup, Task,
};

use crate::channel::{DataChannelFactory, InputReader, LocalEdgeStore, OutputWriter};
use crate::coder::Record;
use crate::state_manager::TaskGroupStateManager;
use crate::transform::{OutputCollector, SourceRegistry, TransformContext, TransformRegistry};

/// Executes one task group attempt.
pub struct TaskGroupExecutor {
    scheduled: ScheduledTaskGroup,
    state_manager: TaskGroupStateManager,
    transforms: Arc<TransformRegistry>,
    sources: Arc<SourceRegistry>,
    data_queue_capacity: usize,
    readers: HashMap<String, Vec<InputReader>>,
    writers: HashMap<String, Vec<OutputWriter>>,
    execution_requested: bool,
}

impl TaskGroupExecutor {
    /// Wires channels for every task and prepares the executor.
    pub fn new(
        scheduled: ScheduledTaskGroup,
        state_manager: TaskGroupStateManager,
        channel_factory: &DataChannelFactory,
        transforms: Arc<TransformRegistry>,
        sources: Arc<SourceRegistry>,
        data_queue_capacity: usize,
    ) -> Result<Self> {
        let mut executor = Self {
            scheduled,
            state_manager,
            transforms,
            sources,
            data_queue_capacity: data_queue_capacity.max(1),
            readers: HashMap::new(),
            writers: HashMap::new(),
            execution_requested: false,
        };
        executor.initialize_data_channels(channel_factory)?;
        Ok(executor)
    }

    /// Builds readers and writers for cross-stage and stage-internal edges of
    /// every task, in topological order.
    fn initialize_data_channels(&mut self, channel_factory: &DataChannelFactory) -> Result<()> {
        let local_edges = LocalEdgeStore::new();
        let task_group = &self.scheduled.task_group;
        let task_group_id = task_group.task_group_id.clone();
        let task_group_index = task_group.task_group_index;

        let tasks: Vec<Task> = task_group
            .task_dag
            .topological_order()?
            .into_iter()
            .cloned()
            .collect();
        let vertex_of_task: HashMap<String, String> = tasks
            .iter()
            .map(|t| (t.task_id().to_string(), t.runtime_vertex_id().to_string()))
            .collect();

        for task in &tasks {
            let task_id = task.task_id().to_string();
            let vertex_id = task.runtime_vertex_id();

            for edge in self
                .scheduled
                .incoming_edges
                .iter()
                .filter(|e| e.dst_vertex_id == vertex_id)
            {
                let reader = channel_factory.create_reader(
                    task_group_index,
                    &task_group_id,
                    edge,
                    Arc::clone(&local_edges),
                );
                self.readers.entry(task_id.clone()).or_default().push(reader);
            }

            for edge in self
                .scheduled
                .outgoing_edges
                .iter()
                .filter(|e| e.src_vertex_id == vertex_id)
            {
                let writer = channel_factory.create_writer(
                    task_group_index,
                    vertex_id,
                    edge,
                    Arc::clone(&local_edges),
                );
                self.writers.entry(task_id.clone()).or_default().push(writer);
            }

            for edge in task_group.task_dag.incoming_edges_of(task.task_id()) {
                let src_vertex = vertex_of_task
                    .get(&edge.src_task_id)
                    .cloned()
                    .unwrap_or_default();
                let reader = channel_factory.create_local_reader(
                    &task_group_id,
                    &src_vertex,
                    edge,
                    Arc::clone(&local_edges),
                )?;
                self.readers.entry(task_id.clone()).or_default().push(reader);
            }

            for edge in task_group.task_dag.outgoing_edges_of(task.task_id()) {
                let writer =
                    channel_factory.create_local_writer(vertex_id, edge, Arc::clone(&local_edges))?;
                self.writers.entry(task_id.clone()).or_default().push(writer);
            }
        }
        Ok(())
    }

    /// Executes the task group. Runs exactly once per instance.
    pub async fn execute(&mut self) -> Result<()> {
        if self.execution_requested {
            return Err(CascadeError::Unknown(format!(
                "task group '{}' execution requested again",
                self.scheduled.task_group.task_group_id
            )));
        }
        self.execution_requested = true;
        info!(
            task_group_id = %self.scheduled.task_group.task_group_id,
            attempt_index = self.scheduled.attempt_index,
            operator = "TaskGroupExecutor",
            "execution started"
        );
        self.state_manager
            .on_task_group_state_changed(TaskGroupState::Executing, Vec::new(), None);

        let tasks: Vec<Task> = self
            .scheduled
            .task_group
            .task_dag
            .topological_order()?
            .into_iter()
            .cloned()
            .collect();

        for task in tasks {
            let task_id = task.task_id().to_string();
            self.state_manager
                .on_task_state_changed(&task_id, TaskState::Executing, None);

            let outcome = match &task {
                Task::BoundedSource(t) => self.launch_bounded_source(t).await,
                Task::Operator(t) => self.launch_operator(t).await,
                Task::MetricCollectionBarrier(t) => {
                    self.launch_metric_collection_barrier(t).await
                }
            };

            match outcome {
                Ok(final_state) => {
                    self.state_manager
                        .on_task_state_changed(&task_id, final_state, None);
                }
                Err(e) if e.is_recoverable() => {
                    let cause = match e {
                        CascadeError::BlockWrite(_) => RecoverableFailureCause::OutputWriteFailure,
                        _ => RecoverableFailureCause::InputReadFailure,
                    };
                    warn!(
                        task_group_id = %self.scheduled.task_group.task_group_id,
                        task_id = %task_id,
                        error = %e,
                        "task failed recoverably"
                    );
                    self.state_manager.on_task_state_changed(
                        &task_id,
                        TaskState::FailedRecoverable,
                        Some(cause),
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.state_manager.on_task_state_changed(
                        &task_id,
                        TaskState::FailedUnrecoverable,
                        None,
                    );
                    return Err(e);
                }
            }
        }
        info!(
            task_group_id = %self.scheduled.task_group.task_group_id,
            state = %self.state_manager.current_state(),
            "execution finished"
        );
        Ok(())
    }

    /// Reads the finite source iterable and writes it to all outgoing edges.
    async fn launch_bounded_source(&mut self, task: &BoundedSourceTask) -> Result<TaskState> {
        let mut source = self.sources.create(&task.source_factory)?;
        let data = source.read()?;
        let mut writers = self.writers.remove(&task.task_id).unwrap_or_default();
        for writer in &mut writers {
            writer.write(data.clone())?;
            writer.close().await?;
        }
        Ok(TaskState::Complete)
    }

    /// Runs the user transform over all non-side inputs.
    async fn launch_operator(&mut self, task: &OperatorTask) -> Result<TaskState> {
        let readers = self.readers.remove(&task.task_id).unwrap_or_default();
        let (side_readers, data_readers): (Vec<_>, Vec<_>) =
            readers.into_iter().partition(|r| r.is_side_input());

        // Side inputs are materialized before per-element processing begins.
        let mut side_inputs = HashMap::new();
        for reader in &side_readers {
            let value = reader.side_input().await?;
            side_inputs.insert(reader.src_vertex_id().to_string(), value);
        }
        let context = TransformContext::new(side_inputs);

        let mut transform = self.transforms.create(&task.transform_factory)?;
        let mut collector = OutputCollector::new();
        transform.prepare(&context, &mut collector);

        // Each completed read pushes one (iterable, source vertex) pair into
        // the bounded queue; the loop below consumes exactly one pair per
        // outstanding future.
        let (tx, mut rx) = mpsc::channel::<(Result<Vec<Record>>, String)>(self.data_queue_capacity);
        let mut source_parallelism: u32 = 0;
        for reader in &data_readers {
            let futures = reader.read()?;
            source_parallelism += reader.source_parallelism();
            let src_vertex_id = reader.src_vertex_id().to_string();
            for future in futures {
                let tx = tx.clone();
                let src_vertex_id = src_vertex_id.clone();
                tokio::spawn(async move {
                    let result = future.await;
                    let _ = tx.send((result, src_vertex_id)).await;
                });
            }
        }
        drop(tx);

        let mut writers = self.writers.remove(&task.task_id).unwrap_or_default();
        for _ in 0..source_parallelism {
            let (result, src_vertex_id) = rx.recv().await.ok_or_else(|| {
                CascadeError::BlockFetch("data queue closed before all reads completed".to_string())
            })?;
            let data = result?;
            transform.on_data(data, &src_vertex_id, &mut collector);
            let output = collector.collect_output();
            if !output.is_empty() {
                for writer in &mut writers {
                    writer.write(output.clone())?;
                }
            }
        }

        transform.close(&mut collector);
        let output = collector.collect_output();
        if writers.is_empty() {
            info!(task_id = %task.task_id, "sink task produced no outgoing edges");
        }
        for writer in &mut writers {
            if !output.is_empty() {
                writer.write(output.clone())?;
            }
            writer.close().await?;
        }
        Ok(TaskState::Complete)
    }

    /// Drains all non-side inputs, forwards them unchanged, and parks the
    /// task so the master may re-optimize the rest of the plan.
    async fn launch_metric_collection_barrier(
        &mut self,
        task: &MetricCollectionBarrierTask,
    ) -> Result<TaskState> {
        let readers = self.readers.remove(&task.task_id).unwrap_or_default();
        let (tx, mut rx) = mpsc::channel::<Result<Vec<Record>>>(self.data_queue_capacity);
        let mut source_parallelism: u32 = 0;
        for reader in readers.iter().filter(|r| !r.is_side_input()) {
            let futures = reader.read()?;
            source_parallelism += reader.source_parallelism();
            for future in futures {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = future.await;
                    let _ = tx.send(result).await;
                });
            }
        }
        drop(tx);

        let mut data = Vec::new();
        for _ in 0..source_parallelism {
            let result = rx.recv().await.ok_or_else(|| {
                CascadeError::BlockFetch("data queue closed before all reads completed".to_string())
            })?;
            data.extend(result?);
        }

        let mut writers = self.writers.remove(&task.task_id).unwrap_or_default();
        for writer in &mut writers {
            writer.write(data.clone())?;
            writer.close().await?;
        }
        Ok(TaskState::OnHold)
    }
}
