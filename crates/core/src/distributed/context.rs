//! Per-shard execution context.
//!
//! A [`DeviceContext`] is handed to every weight-bearing component at
//! construction. It carries the shard's position in the group and the handle
//! used for collectives, so nothing in the graph reaches for global state.

use std::sync::Arc;

use candle_core::Tensor;

use super::communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::LocalProcessGroup;

#[derive(Clone)]
pub struct DeviceContext {
    communicator: Arc<dyn DeviceCommunicator>,
    rank: usize,
    world_size: usize,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl DeviceContext {
    /// Build a context from a communicator; rank and size come from its group.
    pub fn new(communicator: Arc<dyn DeviceCommunicator>) -> Self {
        let pg = communicator.process_group();
        let rank = pg.rank();
        let world_size = pg.world_size();
        Self {
            communicator,
            rank,
            world_size,
        }
    }

    /// Unsharded execution: every collective is the identity.
    pub fn single_device() -> Self {
        Self::new(Arc::new(MockCommunicator::new(LocalProcessGroup::new())))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    pub fn communicator(&self) -> &dyn DeviceCommunicator {
        self.communicator.as_ref()
    }

    /// Sum partial results across shards. Skips the collective at world_size 1.
    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.is_single() {
            return Ok(tensor.clone());
        }
        tracing::trace!(rank = self.rank, dims = ?tensor.dims(), "all_reduce");
        self.communicator.all_reduce(tensor, ReduceOp::Sum)
    }

    /// Size of this shard's slice of a dimension split evenly across the group.
    pub fn shard_size(&self, what: &str, size: usize) -> Result<usize> {
        if size % self.world_size != 0 {
            return Err(DistributedError::IndivisibleShard {
                what: what.to_string(),
                size,
                world_size: self.world_size,
            });
        }
        Ok(size / self.world_size)
    }

    /// `[start, end)` of this shard's slice of a dimension of length `size`.
    pub fn shard_range(&self, what: &str, size: usize) -> Result<(usize, usize)> {
        self.communicator
            .process_group()
            .shard_range(size)
            .ok_or_else(|| DistributedError::IndivisibleShard {
                what: what.to_string(),
                size,
                world_size: self.world_size,
            })
    }
}
