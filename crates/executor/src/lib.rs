//! Worker-side runtime: task-group execution, data channels, block stores
//! and transfer.
//!
//! Architecture role:
//! - executes topologically ordered micro-DAGs of tasks inside one
//!   scheduling unit;
//! - wires local and cross-stage data channels through a channel factory;
//! - reads/writes partitions through a worker partition manager that
//!   consults the master for locations;
//! - frames cross-executor byte transfers with multiplexed pull/push frames.
//!
//! Key modules:
//! - [`executor`]
//! - [`task_group_executor`]
//! - [`state_manager`]
//! - [`channel`]
//! - [`partition_worker`]
//! - [`store`]
//! - [`block_transfer`]
//! - [`coder`]
//! - [`transform`]

pub mod block_transfer;
pub mod channel;
pub mod coder;
pub mod executor;
pub mod partition_worker;
pub mod state_manager;
pub mod store;
pub mod task_group_executor;
pub mod transform;

pub use block_transfer::{BlockTransferEndpoint, DataFrame, FrameType, TransferHandler};
pub use channel::{DataChannelFactory, InputReader, LocalEdgeStore, OutputWriter};
pub use coder::{
    Coder, CoderManager, CoderRegistry, LengthPrefixedCoder, Record, LENGTH_PREFIXED_CODER_ID,
};
pub use executor::Executor;
pub use partition_worker::{BlockPullServer, PartitionManagerWorker};
pub use state_manager::TaskGroupStateManager;
pub use store::{Block, BlockStore, FileStore, MemoryStore, SerializedMemoryStore};
pub use task_group_executor::TaskGroupExecutor;
pub use transform::{
    BoundedSource, OutputCollector, SourceRegistry, Transform, TransformContext, TransformRegistry,
};
