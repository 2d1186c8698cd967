//! Task, task-group and edge descriptors shipped from the scheduler to
//! executors.
//!
//! Contract:
//! - a task group is a small DAG of tasks executed by one worker thread;
//! - task variants form a tagged union the executor pattern-matches on;
//! - user code (sources, transforms) is referenced by factory name so the
//!   whole descriptor stays serializable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::hash_range::HashRange;
use crate::states::{CommunicationPattern, DataStore};

/// One schedulable task inside a task group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    /// Reads a finite iterable from an external source.
    BoundedSource(BoundedSourceTask),
    /// Wraps a user transform with input/output edges.
    Operator(OperatorTask),
    /// Passes data through unchanged while parking the task group in
    /// `ON_HOLD` so the master may re-optimize.
    MetricCollectionBarrier(MetricCollectionBarrierTask),
}

impl Task {
    /// Task identifier, unique within the job.
    pub fn task_id(&self) -> &str {
        match self {
            Task::BoundedSource(t) => &t.task_id,
            Task::Operator(t) => &t.task_id,
            Task::MetricCollectionBarrier(t) => &t.task_id,
        }
    }

    /// Id of the runtime vertex this task was materialized from.
    pub fn runtime_vertex_id(&self) -> &str {
        match self {
            Task::BoundedSource(t) => &t.runtime_vertex_id,
            Task::Operator(t) => &t.runtime_vertex_id,
            Task::MetricCollectionBarrier(t) => &t.runtime_vertex_id,
        }
    }

    /// Index of this task among the parallel tasks of its vertex.
    pub fn index(&self) -> u32 {
        match self {
            Task::BoundedSource(t) => t.index,
            Task::Operator(t) => t.index,
            Task::MetricCollectionBarrier(t) => t.index,
        }
    }
}

/// A task reading a finite iterable from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedSourceTask {
    /// Task identifier.
    pub task_id: String,
    /// Runtime vertex this task belongs to.
    pub runtime_vertex_id: String,
    /// Index among the vertex's parallel tasks.
    pub index: u32,
    /// Name of the registered source factory that builds the reader.
    pub source_factory: String,
}

/// A task wrapping a user transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorTask {
    /// Task identifier.
    pub task_id: String,
    /// Runtime vertex this task belongs to.
    pub runtime_vertex_id: String,
    /// Index among the vertex's parallel tasks.
    pub index: u32,
    /// Name of the registered transform factory.
    pub transform_factory: String,
}

/// A pass-through task that parks its task group for dynamic optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCollectionBarrierTask {
    /// Task identifier.
    pub task_id: String,
    /// Runtime vertex this task belongs to.
    pub runtime_vertex_id: String,
    /// Index among the vertex's parallel tasks.
    pub index: u32,
}

/// Execution properties attached to an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeProperties {
    /// How destination tasks consume source outputs.
    pub communication_pattern: CommunicationPattern,
    /// Which block store backs the edge's partitions.
    pub data_store: DataStore,
    /// Whether this edge is a side input (fully materialized before
    /// per-element processing begins).
    pub side_input: bool,
    /// Identifier of the coder serializing elements on this edge.
    pub coder_id: String,
    /// Number of hash buckets source writers partition into; the key space
    /// destinations carve into hash ranges.
    pub shuffle_bucket_count: u32,
}

impl EdgeProperties {
    /// Plain one-to-one memory edge with the given coder.
    pub fn one_to_one(coder_id: impl Into<String>) -> Self {
        Self {
            communication_pattern: CommunicationPattern::OneToOne,
            data_store: DataStore::Memory,
            side_input: false,
            coder_id: coder_id.into(),
            shuffle_bucket_count: 1,
        }
    }
}

/// A stage-internal edge between two tasks of the same task group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEdge {
    /// Runtime edge identifier.
    pub edge_id: String,
    /// Task id of the producing task.
    pub src_task_id: String,
    /// Task id of the consuming task.
    pub dst_task_id: String,
    /// Execution properties of this edge.
    pub properties: EdgeProperties,
}

/// A cross-stage edge between a source vertex and a destination vertex of
/// different stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEdge {
    /// Runtime edge identifier.
    pub edge_id: String,
    /// Source-side runtime vertex.
    pub src_vertex_id: String,
    /// Destination-side runtime vertex.
    pub dst_vertex_id: String,
    /// Parallelism of the source vertex (number of source partitions).
    pub src_parallelism: u32,
    /// Execution properties of this edge.
    pub properties: EdgeProperties,
    /// For shuffle edges: the hash range assigned to each destination task
    /// group, keyed by task group id.
    #[serde(default)]
    pub task_group_to_hash_range: HashMap<String, HashRange>,
}

/// The micro-DAG of tasks inside one task group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDag {
    /// All tasks of the group.
    pub tasks: Vec<Task>,
    /// Stage-internal edges between tasks of the group.
    pub edges: Vec<RuntimeEdge>,
}

impl TaskDag {
    /// Creates a DAG from tasks and stage-internal edges.
    pub fn new(tasks: Vec<Task>, edges: Vec<RuntimeEdge>) -> Self {
        Self { tasks, edges }
    }

    /// Stage-internal edges arriving at `task_id`.
    pub fn incoming_edges_of(&self, task_id: &str) -> Vec<&RuntimeEdge> {
        self.edges
            .iter()
            .filter(|e| e.dst_task_id == task_id)
            .collect()
    }

    /// Stage-internal edges leaving `task_id`.
    pub fn outgoing_edges_of(&self, task_id: &str) -> Vec<&RuntimeEdge> {
        self.edges
            .iter()
            .filter(|e| e.src_task_id == task_id)
            .collect()
    }

    /// Returns the tasks in a topological order.
    ///
    /// Ties are broken by declaration order so the walk is deterministic.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.task_id(), 0_usize))
            .collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(edge.dst_task_id.as_str()) {
                *d += 1;
            }
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| in_degree[t.task_id()] == 0)
            .collect();
        while let Some(task) = ready.first().copied() {
            ready.remove(0);
            order.push(task);
            for edge in self.outgoing_edges_of(task.task_id()) {
                let d = in_degree
                    .get_mut(edge.dst_task_id.as_str())
                    .ok_or_else(|| {
                        CascadeError::Unknown(format!(
                            "edge '{}' points at unknown task '{}'",
                            edge.edge_id, edge.dst_task_id
                        ))
                    })?;
                *d -= 1;
                if *d == 0 {
                    if let Some(dst) = self.tasks.iter().find(|t| t.task_id() == edge.dst_task_id) {
                        ready.push(dst);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(CascadeError::Unknown(
                "task dag contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }
}

/// A scheduling unit: the task DAG plus identifiers locating it in the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Task group identifier.
    pub task_group_id: String,
    /// Stage this task group belongs to.
    pub stage_id: String,
    /// Index among the stage's parallel task groups.
    pub task_group_index: u32,
    /// The micro-DAG of tasks.
    pub task_dag: TaskDag,
}

/// A task group wrapped with the cross-stage edges and attempt index the
/// executor needs to resolve intermediate data dependencies.
///
/// This is what the scheduler serializes into `ScheduleTaskGroup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskGroup {
    /// Id of the owning job.
    pub job_id: String,
    /// The task group to execute.
    pub task_group: TaskGroup,
    /// Cross-stage edges arriving at this task group's stage.
    pub incoming_edges: Vec<StageEdge>,
    /// Cross-stage edges leaving this task group's stage.
    pub outgoing_edges: Vec<StageEdge>,
    /// Attempt counter, incremented on reschedule after failure.
    pub attempt_index: u32,
}

impl ScheduledTaskGroup {
    /// Encodes the descriptor for transport inside `ScheduleTaskGroup`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CascadeError::Unknown(format!("task group descriptor encode failed: {e}")))
    }

    /// Decodes a descriptor received over the control transport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CascadeError::Unknown(format!("task group descriptor decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(task_id: &str) -> Task {
        Task::BoundedSource(BoundedSourceTask {
            task_id: task_id.to_string(),
            runtime_vertex_id: "v-src".to_string(),
            index: 0,
            source_factory: "ints".to_string(),
        })
    }

    fn operator(task_id: &str) -> Task {
        Task::Operator(OperatorTask {
            task_id: task_id.to_string(),
            runtime_vertex_id: "v-op".to_string(),
            index: 0,
            transform_factory: "identity".to_string(),
        })
    }

    fn edge(id: &str, src: &str, dst: &str) -> RuntimeEdge {
        RuntimeEdge {
            edge_id: id.to_string(),
            src_task_id: src.to_string(),
            dst_task_id: dst.to_string(),
            properties: EdgeProperties::one_to_one("length-prefixed"),
        }
    }

    #[test]
    fn topological_order_respects_edges() {
        let dag = TaskDag::new(
            vec![operator("b"), source("a"), operator("c")],
            vec![edge("e0", "a", "b"), edge("e1", "b", "c")],
        );
        let order: Vec<&str> = dag
            .topological_order()
            .expect("order")
            .iter()
            .map(|t| t.task_id())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let dag = TaskDag::new(
            vec![operator("a"), operator("b")],
            vec![edge("e0", "a", "b"), edge("e1", "b", "a")],
        );
        assert!(dag.topological_order().is_err());
    }

    #[test]
    fn scheduled_task_group_roundtrips_through_bytes() {
        let stg = ScheduledTaskGroup {
            job_id: "job-0".to_string(),
            task_group: TaskGroup {
                task_group_id: "TG-stage0-0".to_string(),
                stage_id: "stage0".to_string(),
                task_group_index: 0,
                task_dag: TaskDag::new(vec![source("a")], vec![]),
            },
            incoming_edges: vec![],
            outgoing_edges: vec![],
            attempt_index: 1,
        };
        let bytes = stg.to_bytes().expect("encode");
        let decoded = ScheduledTaskGroup::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.task_group.task_group_id, "TG-stage0-0");
        assert_eq!(decoded.attempt_index, 1);
    }
}
