//! Shard identity.
//!
//! Every shard runs the same forward graph and meets its peers at the
//! collectives. Transport setup (NCCL, MPI) belongs to the serving layer; the
//! model only reads rank and world size.

/// Position of one shard within a tensor-parallel group.
pub trait ProcessGroup: Send + Sync {
    /// `0..world_size`
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// A group of one, where every collective is the identity.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }

    /// Half-open `[start, end)` slice of a dimension of length `len` owned by
    /// this shard, or `None` when `len` does not split evenly.
    fn shard_range(&self, len: usize) -> Option<(usize, usize)> {
        let ws = self.world_size();
        if ws == 0 || len % ws != 0 {
            return None;
        }
        let chunk = len / ws;
        Some((self.rank() * chunk, (self.rank() + 1) * chunk))
    }
}

/// Fixed rank/size pair without a transport of its own.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Rank 0 of a group of one.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Shard `rank` of an in-process group of `world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        debug_assert!(rank < world_size);
        Self { rank, world_size }
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        // `Default` leaves world_size at 0; treat it as a single device.
        self.world_size.max(1)
    }
}
