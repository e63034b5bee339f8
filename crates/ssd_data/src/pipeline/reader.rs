use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::ops::Range;

/// Cyclic reader over one contiguous shard of a dataset.
///
/// The dataset `0..len` is cut into `num_shards` contiguous ranges and this
/// reader owns range `shard_id`. Reading never ends: when a pass over the
/// shard is exhausted the reader reshuffles it (seeded with `seed + pass`)
/// and starts over, so a batch may straddle two passes.
#[derive(Debug, Clone)]
pub struct ShardReader {
    range: Range<usize>,
    order: Vec<usize>,
    cursor: usize,
    pass: usize,
    shuffle: bool,
    seed: u64,
}

impl ShardReader {
    /// # Errors
    /// `num_shards == 0`, `shard_id >= num_shards`, or a shard that would be
    /// empty because the dataset has fewer items than shards.
    pub fn new(dataset_len: usize, num_shards: usize, shard_id: usize, shuffle: bool, seed: u64) -> Result<Self> {
        ensure!(num_shards > 0, "num_shards must be > 0");
        ensure!(
            shard_id < num_shards,
            "shard_id {} must be < num_shards {}",
            shard_id,
            num_shards
        );
        let range = Self::shard_range(dataset_len, num_shards, shard_id);
        ensure!(
            !range.is_empty(),
            "Shard {} of {} is empty for a dataset of {} items",
            shard_id,
            num_shards,
            dataset_len
        );

        let mut reader = Self {
            order: Vec::with_capacity(range.len()),
            range,
            cursor: 0,
            pass: 0,
            shuffle,
            seed,
        };
        reader.start_pass();
        Ok(reader)
    }

    /// Range of item indices owned by `shard_id`.
    pub fn shard_range(dataset_len: usize, num_shards: usize, shard_id: usize) -> Range<usize> {
        let start = dataset_len * shard_id / num_shards;
        let end = dataset_len * (shard_id + 1) / num_shards;
        start..end
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn shard_len(&self) -> usize {
        self.range.len()
    }

    /// Number of completed passes over the shard.
    pub fn pass(&self) -> usize {
        self.pass
    }

    fn start_pass(&mut self) {
        self.order.clear();
        self.order.extend(self.range.clone());
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.pass as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }

    /// Next `batch_size` indices, each tagged with the pass it was read in.
    pub fn next_batch(&mut self, batch_size: usize) -> Vec<(usize, usize)> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            if self.cursor == self.order.len() {
                self.pass += 1;
                self.start_pass();
            }
            batch.push((self.order[self.cursor], self.pass));
            self.cursor += 1;
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shards_are_contiguous_and_cover() {
        let ranges: Vec<_> = (0..3).map(|id| ShardReader::shard_range(10, 3, id)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn test_sequential_reader_wraps() -> Result<()> {
        let mut reader = ShardReader::new(10, 2, 1, false, 0)?;
        let first: Vec<_> = reader.next_batch(4).into_iter().map(|(i, _)| i).collect();
        let second = reader.next_batch(4);
        assert_eq!(first, vec![5, 6, 7, 8]);
        assert_eq!(second, vec![(9, 0), (5, 1), (6, 1), (7, 1)]);
        assert_eq!(reader.pass(), 1);
        Ok(())
    }

    #[test]
    fn test_every_pass_visits_the_shard_once() -> Result<()> {
        let mut reader = ShardReader::new(100, 4, 2, true, 42)?;
        let first: Vec<_> = reader.next_batch(25).into_iter().map(|(i, _)| i).collect();
        let second: Vec<_> = reader.next_batch(25).into_iter().map(|(i, _)| i).collect();

        let expected: HashSet<usize> = (50..75).collect();
        assert_eq!(first.iter().copied().collect::<HashSet<_>>(), expected);
        assert_eq!(second.iter().copied().collect::<HashSet<_>>(), expected);
        assert_ne!(first, second, "each pass should be reshuffled");
        Ok(())
    }

    #[test]
    fn test_invalid_shards_rejected() {
        assert!(ShardReader::new(10, 0, 0, false, 0).is_err());
        assert!(ShardReader::new(10, 2, 2, false, 0).is_err());
        assert!(ShardReader::new(1, 2, 0, false, 0).is_err());
    }
}
