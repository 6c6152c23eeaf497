//! Device communicator for collective operations.
//!
//! The forward graph needs a single collective: the sum all-reduce at the end
//! of the attention output projection and at the end of the MoE/MLP block.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction applied by [`DeviceCommunicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum of the partial results.
    Sum,
}

/// Trait for device-to-device communication.
///
/// Every shard must issue the same sequence of collectives; a shard that takes
/// a different branch leaves its peers blocked forever.
pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Reduce `tensor` across all ranks; every rank receives the result.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;
}

/// Identity communicator.
///
/// Correct for `world_size == 1`. With a simulated larger group it still
/// returns its input, which is only useful for shape-level tests.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

// ─── In-process thread group ────────────────────────────────────────────────

struct GroupState {
    barrier: Barrier,
    reduce_slot: Mutex<Option<Tensor>>,
}

/// Communicator for shards that run as threads of one process.
///
/// All members of a group share a reduction buffer and a `std::sync::Barrier`,
/// so `all_reduce` has the same blocking semantics as a real process group:
/// each call returns only after every rank has contributed.
pub struct ThreadCommunicator {
    group: LocalProcessGroup,
    state: Arc<GroupState>,
}

impl ThreadCommunicator {
    /// Create one communicator per rank. Hand each to a different thread.
    pub fn group(world_size: usize) -> Result<Vec<ThreadCommunicator>> {
        if world_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        let state = Arc::new(GroupState {
            barrier: Barrier::new(world_size),
            reduce_slot: Mutex::new(None),
        });
        Ok((0..world_size)
            .map(|rank| ThreadCommunicator {
                group: LocalProcessGroup::with_rank(rank, world_size),
                state: Arc::clone(&state),
            })
            .collect())
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|e| DistributedError::Poisoned(e.to_string()))
    }

    fn combine(acc: &Tensor, next: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if acc.dims() != next.dims() {
            return Err(DistributedError::ShapeMismatch {
                expected: acc.dims().to_vec(),
                actual: next.dims().to_vec(),
            });
        }
        match op {
            ReduceOp::Sum => Ok(acc.add(next)?),
        }
    }
}

impl DeviceCommunicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.group.is_single() {
            return Ok(tensor.clone());
        }

        {
            let mut slot = Self::lock(&self.state.reduce_slot)?;
            let next = match slot.take() {
                None => tensor.clone(),
                Some(acc) => Self::combine(&acc, tensor, op)?,
            };
            *slot = Some(next);
        }
        self.state.barrier.wait();

        let reduced = Self::lock(&self.state.reduce_slot)?
            .clone()
            .ok_or_else(|| DistributedError::Poisoned("reduction buffer empty".to_string()))?;

        // Everyone has read the result; one rank clears the buffer for the next call.
        if self.state.barrier.wait().is_leader() {
            *Self::lock(&self.state.reduce_slot)? = None;
        }
        self.state.barrier.wait();
        Ok(reduced)
    }
}
