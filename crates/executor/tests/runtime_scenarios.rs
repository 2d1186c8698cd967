//! End-to-end runtime scenarios: real master and executors wired over the
//! local dispatcher.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use cascade_common::states::{
    CommunicationPattern, DataStore, PartitionState, RecoverableFailureCause, TaskGroupState,
};
use cascade_common::{
    ids, BoundedSourceTask, EdgeProperties, HashRange, MetricCollectionBarrierTask, OperatorTask,
    Result, RuntimeConfig, RuntimeEdge, ScheduledTaskGroup, StageEdge, Task, TaskDag, TaskGroup,
};
use cascade_executor::block_transfer::connect_local;
use cascade_executor::{
    BlockPullServer, BoundedSource, CoderRegistry, Executor, OutputCollector, Record,
    SourceRegistry, Transform, TransformContext, TransformRegistry, LENGTH_PREFIXED_CODER_ID,
};
use cascade_master::{PartitionManagerMaster, RuntimeMaster, SchedulerContract};
use cascade_message::{
    LocalMessageDispatcher, Message, MessageEnvironment, Payload, EXECUTOR_LISTENER_ID,
    RUNTIME_MASTER_LISTENER_ID,
};

struct Transition {
    task_group_id: String,
    state: TaskGroupState,
    tasks_on_hold: Vec<String>,
    failure_cause: Option<RecoverableFailureCause>,
}

#[derive(Default)]
struct RecordingScheduler {
    transitions: Mutex<Vec<Transition>>,
}

impl RecordingScheduler {
    fn states_of(&self, task_group_id: &str) -> Vec<TaskGroupState> {
        self.transitions
            .lock()
            .expect("lock")
            .iter()
            .filter(|t| t.task_group_id == task_group_id)
            .map(|t| t.state)
            .collect()
    }

    fn on_hold_tasks_of(&self, task_group_id: &str) -> Vec<String> {
        self.transitions
            .lock()
            .expect("lock")
            .iter()
            .filter(|t| t.task_group_id == task_group_id && t.state == TaskGroupState::OnHold)
            .flat_map(|t| t.tasks_on_hold.clone())
            .collect()
    }
}

#[async_trait]
impl SchedulerContract for RecordingScheduler {
    async fn on_task_group_state_changed(
        &self,
        _executor_id: &str,
        task_group_id: &str,
        state: TaskGroupState,
        _attempt_index: u32,
        tasks_on_hold: Vec<String>,
        failure_cause: Option<RecoverableFailureCause>,
    ) {
        self.transitions.lock().expect("lock").push(Transition {
            task_group_id: task_group_id.to_string(),
            state,
            tasks_on_hold,
            failure_cause,
        });
    }

    async fn on_recompute_requested(&self, _task_group_ids: HashSet<String>) {}
}

struct VecSource {
    records: Vec<Record>,
}

impl BoundedSource for VecSource {
    fn read(&mut self) -> Result<Vec<Record>> {
        Ok(self.records.clone())
    }
}

struct CollectSink {
    out: Arc<Mutex<Vec<Record>>>,
}

impl Transform for CollectSink {
    fn prepare(&mut self, _context: &TransformContext, _collector: &mut OutputCollector) {}

    fn on_data(
        &mut self,
        data: Vec<Record>,
        _src_vertex_id: &str,
        _collector: &mut OutputCollector,
    ) {
        self.out.lock().expect("lock").extend(data);
    }

    fn close(&mut self, _collector: &mut OutputCollector) {}
}

struct Harness {
    dispatcher: Arc<LocalMessageDispatcher>,
    master_env: MessageEnvironment,
    partition_manager: Arc<PartitionManagerMaster>,
    master: Arc<RuntimeMaster>,
    scheduler: Arc<RecordingScheduler>,
    transforms: Arc<TransformRegistry>,
    sources: Arc<SourceRegistry>,
    config: RuntimeConfig,
}

fn temp_root(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

fn harness() -> Harness {
    let dispatcher = LocalMessageDispatcher::new();
    let master_env = MessageEnvironment::new("master", dispatcher.clone(), Duration::from_secs(2));
    let partition_manager = Arc::new(PartitionManagerMaster::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let master = RuntimeMaster::new(partition_manager.clone(), scheduler.clone());
    master_env.setup_listener(RUNTIME_MASTER_LISTENER_ID, master.clone());
    let config = RuntimeConfig {
        executor_capacity: 4,
        local_store_root: temp_root("cascade_scenarios_local"),
        remote_store_root: temp_root("cascade_scenarios_remote"),
        ..RuntimeConfig::default()
    };
    Harness {
        dispatcher,
        master_env,
        partition_manager,
        master,
        scheduler,
        transforms: TransformRegistry::new(),
        sources: SourceRegistry::new(),
        config,
    }
}

impl Harness {
    fn spawn_executor(&self, executor_id: &str) -> (MessageEnvironment, Arc<Executor>) {
        let env = MessageEnvironment::new(
            executor_id,
            self.dispatcher.clone(),
            Duration::from_secs(2),
        );
        let executor = Executor::start(
            &self.config,
            &env,
            "master",
            CoderRegistry::with_defaults(),
            self.transforms.clone(),
            self.sources.clone(),
        )
        .expect("executor start");
        (env, executor)
    }

    /// Plays the external scheduler: initializes produced partitions, marks
    /// the producer scheduled, and dispatches the descriptor.
    fn schedule(&self, executor_id: &str, scheduled: &ScheduledTaskGroup) {
        let task_group_id = &scheduled.task_group.task_group_id;
        for edge in &scheduled.outgoing_edges {
            let partition_id =
                ids::partition_id(&edge.edge_id, scheduled.task_group.task_group_index);
            self.partition_manager
                .initialize_state(&partition_id, task_group_id);
        }
        self.partition_manager
            .on_producer_task_group_scheduled(task_group_id);

        let sender = self
            .master_env
            .get_sender(executor_id, EXECUTOR_LISTENER_ID)
            .expect("executor sender");
        sender
            .send(Message::new(
                EXECUTOR_LISTENER_ID,
                Payload::ScheduleTaskGroup {
                    task_group: scheduled.to_bytes().expect("encode"),
                },
            ))
            .expect("dispatch");
    }

    async fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn edge_properties(
    pattern: CommunicationPattern,
    data_store: DataStore,
    shuffle_bucket_count: u32,
) -> EdgeProperties {
    EdgeProperties {
        communication_pattern: pattern,
        data_store,
        side_input: false,
        coder_id: LENGTH_PREFIXED_CODER_ID.to_string(),
        shuffle_bucket_count,
    }
}

fn source_task_group(
    stage_id: &str,
    index: u32,
    source_factory: &str,
    outgoing: Vec<StageEdge>,
) -> ScheduledTaskGroup {
    let task_group_id = ids::task_group_id(stage_id, index);
    ScheduledTaskGroup {
        job_id: "job-0".to_string(),
        task_group: TaskGroup {
            task_group_id: task_group_id.clone(),
            stage_id: stage_id.to_string(),
            task_group_index: index,
            task_dag: TaskDag::new(
                vec![Task::BoundedSource(BoundedSourceTask {
                    task_id: ids::task_id("v-source", &task_group_id),
                    runtime_vertex_id: "v-source".to_string(),
                    index,
                    source_factory: source_factory.to_string(),
                })],
                vec![],
            ),
        },
        incoming_edges: vec![],
        outgoing_edges: outgoing,
        attempt_index: 1,
    }
}

fn sink_task_group(
    stage_id: &str,
    index: u32,
    transform_factory: &str,
    incoming: Vec<StageEdge>,
) -> ScheduledTaskGroup {
    let task_group_id = ids::task_group_id(stage_id, index);
    ScheduledTaskGroup {
        job_id: "job-0".to_string(),
        task_group: TaskGroup {
            task_group_id: task_group_id.clone(),
            stage_id: stage_id.to_string(),
            task_group_index: index,
            task_dag: TaskDag::new(
                vec![Task::Operator(OperatorTask {
                    task_id: ids::task_id("v-sink", &task_group_id),
                    runtime_vertex_id: "v-sink".to_string(),
                    index,
                    transform_factory: transform_factory.to_string(),
                })],
                vec![],
            ),
        },
        incoming_edges: incoming,
        outgoing_edges: vec![],
        attempt_index: 1,
    }
}

fn register_sink(h: &Harness, name: &str) -> Arc<Mutex<Vec<Record>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let captured = out.clone();
    h.transforms.register(name, move || {
        Box::new(CollectSink {
            out: captured.clone(),
        })
    });
    out
}

#[tokio::test]
async fn one_to_one_source_to_sink_delivers_in_order() {
    let h = harness();
    h.sources.register("ints-123", || {
        Box::new(VecSource {
            records: vec![
                Record::new(1, vec![1_u8]),
                Record::new(2, vec![2_u8]),
                Record::new(3, vec![3_u8]),
            ],
        })
    });
    let sink_out = register_sink(&h, "collect-sink");
    let (_env, _executor) = h.spawn_executor("exec-1");

    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::OneToOne, DataStore::LocalFile, 1),
        task_group_to_hash_range: HashMap::new(),
    };

    let producer = source_task_group("s0", 0, "ints-123", vec![edge.clone()]);
    let consumer = sink_task_group("s1", 0, "collect-sink", vec![edge]);

    h.schedule("exec-1", &producer);
    assert_eq!(
        h.partition_manager.get_partition_state("e0#0"),
        Some(PartitionState::Scheduled)
    );
    h.schedule("exec-1", &consumer);

    h.wait_until("sink received records", || {
        sink_out.lock().expect("lock").len() == 3
    })
    .await;
    let payloads: Vec<u8> = sink_out
        .lock()
        .expect("lock")
        .iter()
        .map(|r| r.payload[0])
        .collect();
    assert_eq!(payloads, vec![1, 2, 3]);
    assert_eq!(
        h.partition_manager.get_partition_state("e0#0"),
        Some(PartitionState::Committed)
    );

    h.wait_until("both task groups completed", || {
        h.scheduler.states_of("TG-s0-0").contains(&TaskGroupState::Complete)
            && h.scheduler.states_of("TG-s1-0").contains(&TaskGroupState::Complete)
    })
    .await;
    // Emitted transitions are a prefix of READY, EXECUTING, terminal.
    assert_eq!(
        h.scheduler.states_of("TG-s0-0"),
        vec![
            TaskGroupState::Ready,
            TaskGroupState::Executing,
            TaskGroupState::Complete
        ]
    );
}

#[tokio::test]
async fn broadcast_delivers_every_partition_to_the_consumer() {
    let h = harness();
    h.sources.register("src-a", || {
        Box::new(VecSource {
            records: vec![Record::new(0, b"A".to_vec())],
        })
    });
    h.sources.register("src-b", || {
        Box::new(VecSource {
            records: vec![Record::new(0, b"B".to_vec())],
        })
    });
    let sink_out = register_sink(&h, "broadcast-sink");
    let (_env, _executor) = h.spawn_executor("exec-1");

    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 2,
        properties: edge_properties(
            CommunicationPattern::Broadcast,
            DataStore::SerializedMemory,
            1,
        ),
        task_group_to_hash_range: HashMap::new(),
    };

    h.schedule("exec-1", &source_task_group("s0", 0, "src-a", vec![edge.clone()]));
    h.schedule("exec-1", &source_task_group("s0", 1, "src-b", vec![edge.clone()]));
    h.schedule("exec-1", &sink_task_group("s1", 0, "broadcast-sink", vec![edge]));

    h.wait_until("sink received both partitions", || {
        sink_out.lock().expect("lock").len() == 2
    })
    .await;
    let mut payloads: Vec<Vec<u8>> = sink_out
        .lock()
        .expect("lock")
        .iter()
        .map(|r| r.payload.clone())
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"A".to_vec(), b"B".to_vec()]);
}

#[tokio::test]
async fn shuffle_respects_skewed_hash_range_assignments() {
    let h = harness();
    // Each producer emits 100 one-byte elements in bucket 0 and one element
    // in each of buckets 1..4.
    h.sources.register("skewed", || {
        let mut records = Vec::new();
        for _ in 0..100 {
            records.push(Record::new(0, vec![0_u8]));
        }
        for key in 1..4 {
            records.push(Record::new(key, vec![key as u8]));
        }
        Box::new(VecSource { records })
    });
    let c0_out = register_sink(&h, "sink-c0");
    let c1_out = register_sink(&h, "sink-c1");
    let (_env, _executor) = h.spawn_executor("exec-1");

    let mut ranges = HashMap::new();
    ranges.insert(ids::task_group_id("s1", 0), HashRange::new(0, 1));
    ranges.insert(ids::task_group_id("s1", 1), HashRange::new(1, 4));
    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 2,
        properties: edge_properties(CommunicationPattern::Shuffle, DataStore::Memory, 4),
        task_group_to_hash_range: ranges,
    };

    h.schedule("exec-1", &source_task_group("s0", 0, "skewed", vec![edge.clone()]));
    h.schedule("exec-1", &source_task_group("s0", 1, "skewed", vec![edge.clone()]));
    h.schedule("exec-1", &sink_task_group("s1", 0, "sink-c0", vec![edge.clone()]));
    h.schedule("exec-1", &sink_task_group("s1", 1, "sink-c1", vec![edge]));

    h.wait_until("both consumers completed", || {
        h.scheduler.states_of("TG-s1-0").contains(&TaskGroupState::Complete)
            && h.scheduler.states_of("TG-s1-1").contains(&TaskGroupState::Complete)
    })
    .await;

    // Hot bucket to c0, the tail to c1; together the full multiset.
    assert_eq!(c0_out.lock().expect("lock").len(), 200);
    assert_eq!(c1_out.lock().expect("lock").len(), 6);
    assert_eq!(
        h.master.data_sizes_of("e0#0"),
        Some(vec![100, 1, 1, 1])
    );
    assert_eq!(
        h.master.data_sizes_of("e0#1"),
        Some(vec![100, 1, 1, 1])
    );
}

#[tokio::test]
async fn metric_collection_barrier_parks_the_task_group() {
    let h = harness();
    h.sources.register("ints-barrier", || {
        Box::new(VecSource {
            records: vec![Record::new(0, vec![7_u8]), Record::new(1, vec![9_u8])],
        })
    });
    let (_env, _executor) = h.spawn_executor("exec-1");

    let outgoing = StageEdge {
        edge_id: "e1".to_string(),
        src_vertex_id: "v-barrier".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::OneToOne, DataStore::Memory, 1),
        task_group_to_hash_range: HashMap::new(),
    };

    let task_group_id = ids::task_group_id("s0", 0);
    let source_task_id = ids::task_id("v-source", &task_group_id);
    let barrier_task_id = ids::task_id("v-barrier", &task_group_id);
    let scheduled = ScheduledTaskGroup {
        job_id: "job-0".to_string(),
        task_group: TaskGroup {
            task_group_id: task_group_id.clone(),
            stage_id: "s0".to_string(),
            task_group_index: 0,
            task_dag: TaskDag::new(
                vec![
                    Task::BoundedSource(BoundedSourceTask {
                        task_id: source_task_id.clone(),
                        runtime_vertex_id: "v-source".to_string(),
                        index: 0,
                        source_factory: "ints-barrier".to_string(),
                    }),
                    Task::MetricCollectionBarrier(MetricCollectionBarrierTask {
                        task_id: barrier_task_id.clone(),
                        runtime_vertex_id: "v-barrier".to_string(),
                        index: 0,
                    }),
                ],
                vec![RuntimeEdge {
                    edge_id: "e-internal".to_string(),
                    src_task_id: source_task_id,
                    dst_task_id: barrier_task_id.clone(),
                    properties: edge_properties(
                        CommunicationPattern::OneToOne,
                        DataStore::Memory,
                        1,
                    ),
                }],
            ),
        },
        incoming_edges: vec![],
        outgoing_edges: vec![outgoing],
        attempt_index: 1,
    };

    h.schedule("exec-1", &scheduled);
    h.wait_until("task group parked", || {
        h.scheduler
            .states_of(&task_group_id)
            .contains(&TaskGroupState::OnHold)
    })
    .await;

    let states = h.scheduler.states_of(&task_group_id);
    assert!(!states.contains(&TaskGroupState::Complete));
    assert_eq!(
        h.scheduler.on_hold_tasks_of(&task_group_id),
        vec![barrier_task_id.clone()]
    );
    // The barrier still forwards data downstream before parking.
    assert_eq!(
        h.partition_manager.get_partition_state("e1#0"),
        Some(PartitionState::Committed)
    );
}

#[tokio::test]
async fn remote_file_writes_reserve_and_commit_blocks_with_the_master() {
    let h = harness();
    h.sources.register("remote-skewed", || {
        Box::new(VecSource {
            records: vec![
                Record::new(0, b"k0".to_vec()),
                Record::new(1, b"k1".to_vec()),
                Record::new(2, b"k2".to_vec()),
                Record::new(3, b"k3".to_vec()),
            ],
        })
    });
    let sink_out = register_sink(&h, "remote-file-sink");
    let (_env, _executor) = h.spawn_executor("exec-1");

    let mut ranges = HashMap::new();
    ranges.insert(ids::task_group_id("s1", 0), HashRange::new(0, 4));
    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::Shuffle, DataStore::RemoteFile, 4),
        task_group_to_hash_range: ranges,
    };

    h.schedule("exec-1", &source_task_group("s0", 0, "remote-skewed", vec![edge.clone()]));
    h.schedule("exec-1", &sink_task_group("s1", 0, "remote-file-sink", vec![edge]));

    h.wait_until("sink read the remote partition", || {
        sink_out.lock().expect("lock").len() == 4
    })
    .await;

    // The reservation pair left a committed block index on the master.
    let blocks = h
        .partition_manager
        .block_metadata("e0#0")
        .expect("metadata");
    assert_eq!(blocks.len(), 4);
    assert!(blocks.iter().all(|b| b.element_count == 1));
    assert_eq!(
        h.partition_manager.get_partition_state("e0#0"),
        Some(PartitionState::Committed)
    );
}

#[tokio::test]
async fn missing_hash_range_assignment_fails_the_consumer_recoverably() {
    let h = harness();
    h.sources.register("tiny", || {
        Box::new(VecSource {
            records: vec![Record::new(0, vec![1_u8])],
        })
    });
    register_sink(&h, "unassigned-sink");
    let (_env, _executor) = h.spawn_executor("exec-1");

    // No hash range assigned to the consumer task group.
    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::Shuffle, DataStore::Memory, 2),
        task_group_to_hash_range: HashMap::new(),
    };

    h.schedule("exec-1", &source_task_group("s0", 0, "tiny", vec![edge.clone()]));
    h.schedule("exec-1", &sink_task_group("s1", 0, "unassigned-sink", vec![edge]));

    h.wait_until("consumer failed recoverably", || {
        h.scheduler
            .states_of("TG-s1-0")
            .contains(&TaskGroupState::FailedRecoverable)
    })
    .await;
    let cause = h
        .scheduler
        .transitions
        .lock()
        .expect("lock")
        .iter()
        .find(|t| t.state == TaskGroupState::FailedRecoverable)
        .and_then(|t| t.failure_cause);
    assert_eq!(cause, Some(RecoverableFailureCause::InputReadFailure));
}

struct SideInputProbe {
    seen_side: Arc<Mutex<Vec<Record>>>,
    seen_main: Arc<Mutex<Vec<Record>>>,
}

impl Transform for SideInputProbe {
    fn prepare(&mut self, context: &TransformContext, _collector: &mut OutputCollector) {
        if let Some(side) = context.side_input("v-side") {
            self.seen_side.lock().expect("lock").extend_from_slice(side);
        }
    }

    fn on_data(
        &mut self,
        data: Vec<Record>,
        _src_vertex_id: &str,
        _collector: &mut OutputCollector,
    ) {
        self.seen_main.lock().expect("lock").extend(data);
    }

    fn close(&mut self, _collector: &mut OutputCollector) {}
}

#[tokio::test]
async fn side_inputs_are_materialized_before_processing() {
    let h = harness();
    h.sources.register("side-src", || {
        Box::new(VecSource {
            records: vec![Record::new(0, b"side-value".to_vec())],
        })
    });
    h.sources.register("main-src", || {
        Box::new(VecSource {
            records: vec![Record::new(0, b"main-value".to_vec())],
        })
    });
    let seen_side = Arc::new(Mutex::new(Vec::new()));
    let seen_main = Arc::new(Mutex::new(Vec::new()));
    {
        let seen_side = seen_side.clone();
        let seen_main = seen_main.clone();
        h.transforms.register("side-probe", move || {
            Box::new(SideInputProbe {
                seen_side: seen_side.clone(),
                seen_main: seen_main.clone(),
            })
        });
    }
    let (_env, _executor) = h.spawn_executor("exec-1");

    let mut side_properties =
        edge_properties(CommunicationPattern::Broadcast, DataStore::Memory, 1);
    side_properties.side_input = true;
    let side_edge = StageEdge {
        edge_id: "e-side".to_string(),
        src_vertex_id: "v-side".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: side_properties,
        task_group_to_hash_range: HashMap::new(),
    };
    let main_edge = StageEdge {
        edge_id: "e-main".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::OneToOne, DataStore::Memory, 1),
        task_group_to_hash_range: HashMap::new(),
    };

    let mut side_producer = source_task_group("s0", 0, "side-src", vec![side_edge.clone()]);
    side_producer.task_group.task_dag = TaskDag::new(
        vec![Task::BoundedSource(BoundedSourceTask {
            task_id: ids::task_id("v-side", &side_producer.task_group.task_group_id),
            runtime_vertex_id: "v-side".to_string(),
            index: 0,
            source_factory: "side-src".to_string(),
        })],
        vec![],
    );
    let main_producer = source_task_group("s1", 0, "main-src", vec![main_edge.clone()]);
    let consumer = sink_task_group("s2", 0, "side-probe", vec![side_edge, main_edge]);

    h.schedule("exec-1", &side_producer);
    h.schedule("exec-1", &main_producer);
    h.schedule("exec-1", &consumer);

    h.wait_until("probe saw both inputs", || {
        !seen_side.lock().expect("lock").is_empty() && !seen_main.lock().expect("lock").is_empty()
    })
    .await;
    assert_eq!(seen_side.lock().expect("lock")[0].payload, b"side-value");
    assert_eq!(seen_main.lock().expect("lock")[0].payload, b"main-value");
}

#[tokio::test]
async fn consumer_pulls_partition_from_a_peer_executor() {
    let h = harness();
    h.sources.register("ints-remote", || {
        Box::new(VecSource {
            records: vec![Record::new(0, b"over the wire".to_vec())],
        })
    });
    let sink_out = register_sink(&h, "remote-sink");
    let (_env1, executor1) = h.spawn_executor("exec-1");
    let (_env2, executor2) = h.spawn_executor("exec-2");

    // Wire a framed transfer channel between the two executors.
    let (endpoint1, endpoint2) = connect_local(
        BlockPullServer::new(executor1.partition_worker()),
        BlockPullServer::new(executor2.partition_worker()),
        32,
    );
    executor1.partition_worker().connect_peer("exec-2", endpoint1);
    executor2.partition_worker().connect_peer("exec-1", endpoint2);

    let edge = StageEdge {
        edge_id: "e0".to_string(),
        src_vertex_id: "v-source".to_string(),
        dst_vertex_id: "v-sink".to_string(),
        src_parallelism: 1,
        properties: edge_properties(CommunicationPattern::OneToOne, DataStore::Memory, 1),
        task_group_to_hash_range: HashMap::new(),
    };

    // Produce on exec-1, consume on exec-2: the consumer's local store
    // misses, the master answers with the owner, and the bytes arrive over
    // the block transfer framing.
    h.schedule("exec-1", &source_task_group("s0", 0, "ints-remote", vec![edge.clone()]));
    h.schedule("exec-2", &sink_task_group("s1", 0, "remote-sink", vec![edge]));

    h.wait_until("sink received the pulled partition", || {
        sink_out.lock().expect("lock").len() == 1
    })
    .await;
    assert_eq!(
        sink_out.lock().expect("lock")[0].payload,
        b"over the wire".to_vec()
    );
}
