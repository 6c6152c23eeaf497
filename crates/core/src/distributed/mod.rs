//! Distributed computing abstractions for tensor parallelism.
//!
//! - [`ProcessGroup`] - rank and world size of a shard
//! - [`DeviceCommunicator`] - the sum all-reduce between shards
//! - [`DeviceContext`] - what a weight-bearing component needs at construction
//! - [`ColumnParallelLinear`] / [`RowParallelLinear`] - sharded matmuls
//!
//! # Architecture
//!
//! - Single device: every collective is the identity (world_size=1 bypass)
//! - Multiple shards: each shard runs the same graph and meets its peers at
//!   `all_reduce`. [`ThreadCommunicator`] provides the in-process transport.
//!
//! # Usage
//!
//! ```ignore
//! use deepseek_moe_core::distributed::{DeviceContext, ThreadCommunicator};
//!
//! let ctx = DeviceContext::single_device();
//! assert_eq!(ctx.world_size(), 1);
//!
//! let shards: Vec<DeviceContext> = ThreadCommunicator::group(2)?
//!     .into_iter()
//!     .map(|c| DeviceContext::new(std::sync::Arc::new(c)))
//!     .collect();
//! ```

mod communicator;
mod context;
mod error;
mod parallel_layers;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp, ThreadCommunicator};
pub use context::DeviceContext;
pub use error::{DistributedError, Result};
pub use parallel_layers::{
    shard_along, ColumnParallelLinear, RowParallelLinear, ShardKind, ShardSpec,
};
pub use process_group::{LocalProcessGroup, ProcessGroup};
