use engine::Value;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::shard::Shard;
use crate::error::{Result, RunnerErr};

/// Sharded training-data source consumed by the runner.
///
/// One shard is current at a time; the runner walks batches of the
/// current shard, then advances. Shuffling is in place and affects only
/// the current shard.
pub trait DataLoader {
    /// Ordered names of the tensors every batch yields.
    fn tensor_names(&self) -> &[String];

    fn num_shards(&self) -> usize;

    fn shard_index(&self) -> usize;

    /// Selects the current shard.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when `index` is out of range.
    fn set_shard(&mut self, index: usize) -> Result<()>;

    /// Moves to the next shard, wrapping after the last one.
    fn advance_shard(&mut self);

    /// Batches in the current shard, counting a partial tail batch.
    fn num_batches(&self, batch_size: usize) -> usize;

    /// Returns the `index`-th batch of the current shard, parallel to
    /// [`tensor_names`](Self::tensor_names).
    fn batch(&self, batch_size: usize, index: usize) -> Vec<Value>;

    /// Shuffles the current shard in place.
    fn shuffle(&mut self);
}

/// Deterministic in-memory loader backing tests and demos.
#[derive(Debug, Clone)]
pub struct InMemoryDataLoader {
    names: Vec<String>,
    shards: Vec<Shard>,
    current: usize,
    rng: StdRng,
}

impl InMemoryDataLoader {
    /// Creates a loader over owned shards.
    ///
    /// # Args
    /// * `names` - Tensor names, parallel to every shard's columns.
    /// * `shards` - At least one shard of aligned columns.
    /// * `seed` - Seed for the shuffle rng.
    ///
    /// # Panics
    /// - if `shards` is empty
    /// - if any shard's column count differs from `names.len()`
    pub fn new(names: Vec<String>, shards: Vec<Shard>, seed: u64) -> Self {
        assert!(!shards.is_empty(), "loader needs at least one shard");
        for shard in &shards {
            assert_eq!(
                shard.num_columns(),
                names.len(),
                "shard columns must match tensor names"
            );
        }
        Self {
            names,
            shards,
            current: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DataLoader for InMemoryDataLoader {
    fn tensor_names(&self) -> &[String] {
        &self.names
    }

    fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self) -> usize {
        self.current
    }

    fn set_shard(&mut self, index: usize) -> Result<()> {
        if index >= self.shards.len() {
            return Err(RunnerErr::InvalidConfig(format!(
                "shard index {index} out of range for {} shards",
                self.shards.len()
            )));
        }
        self.current = index;
        Ok(())
    }

    fn advance_shard(&mut self) {
        self.current = (self.current + 1) % self.shards.len();
    }

    fn num_batches(&self, batch_size: usize) -> usize {
        self.shards[self.current].num_batches(batch_size)
    }

    fn batch(&self, batch_size: usize, index: usize) -> Vec<Value> {
        self.shards[self.current].batch(batch_size, index)
    }

    fn shuffle(&mut self) {
        self.shards[self.current].shuffle(&mut self.rng);
    }
}
