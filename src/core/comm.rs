//! Collective communication between tensor-parallel shards.
//!
//! Every shard must issue its collectives in the same order. That is a
//! protocol invariant of the caller; a shard that skips a call leaves the
//! others blocked.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Sum all-reduce across the shards of one tensor-parallel group.
pub trait Communicator: Send + Sync {
    /// This shard's rank.
    fn rank(&self) -> usize;

    /// Number of shards in the group.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` over all shards, result on every shard.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// Communicator for a world of one: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

#[derive(Debug)]
struct ReduceState {
    barrier: Barrier,
    contributions: Mutex<Vec<Option<Vec<f32>>>>,
}

/// In-process communicator for shards running on separate threads.
///
/// Each call deposits this rank's buffer, waits for every rank, sums all
/// buffers in rank order (so every shard computes a bit-identical result)
/// and waits again before the buffers are recycled.
#[derive(Debug, Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    world_size: usize,
    state: Arc<ReduceState>,
}

impl ThreadCommunicator {
    /// Create one communicator per rank of a `world_size` group.
    pub fn group(world_size: usize) -> Vec<Self> {
        let state = Arc::new(ReduceState {
            barrier: Barrier::new(world_size),
            contributions: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                state: Arc::clone(&state),
            })
            .collect()
    }

    fn lock_contributions(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Vec<f32>>>>> {
        self.state
            .contributions
            .lock()
            .map_err(|_| Error::Collective(format!("rank {} found a poisoned buffer", self.rank)))
    }

    fn sum_contributions(&self) -> Result<Vec<f32>> {
        let contributions = self.lock_contributions()?;
        let mut sum: Vec<f32> = Vec::new();
        for (rank, contribution) in contributions.iter().enumerate() {
            let buffer = contribution
                .as_ref()
                .ok_or_else(|| Error::Collective(format!("rank {rank} did not contribute")))?;
            if rank == 0 {
                sum = buffer.clone();
            } else if buffer.len() != sum.len() {
                return Err(Error::Collective(format!(
                    "rank {rank} contributed {} elements, rank 0 contributed {}",
                    buffer.len(),
                    sum.len()
                )));
            } else {
                sum.iter_mut().zip(buffer).for_each(|(a, b)| *a += b);
            }
        }
        Ok(sum)
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }

        let dtype = tensor.dtype();
        // Every rank passes both barriers, even on failure, so the group
        // stays in lockstep. Errors surface only after the second one.
        let contributed = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(Error::from)
            .and_then(|local| {
                self.lock_contributions()
                    .map(|mut buffers| buffers[self.rank] = Some(local))
            });
        self.state.barrier.wait();

        let reduced = contributed.and_then(|()| self.sum_contributions());
        self.state.barrier.wait();
        let cleared = self
            .lock_contributions()
            .map(|mut buffers| buffers[self.rank] = None);

        let reduced = reduced?;
        cleared?;
        let out = Tensor::from_vec(reduced, tensor.shape(), tensor.device())?;
        Ok(out.to_dtype(dtype)?)
    }
}
