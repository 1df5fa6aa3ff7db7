use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{ImageShape, Partition};

/// A fixed-size slice of a partition, stacked and ready for a forward pass.
/// The final batch of a traversal may be smaller than the nominal size.
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub images: Vec<f32>,
    pub labels: Vec<i64>,
    pub shape: ImageShape,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Trait for minibatch supply.
pub trait BatchSource {
    /// Get the next batch, or `None` once the traversal is exhausted.
    fn next_batch(&mut self) -> Result<Option<Minibatch>>;

    /// Start a fresh traversal (re-shuffled if shuffling is enabled).
    fn reset(&mut self);

    /// Total number of batches per traversal (if known).
    fn num_batches(&self) -> Option<usize>;
}

/// Lazy, restartable batch supply over one dataset partition.
///
/// With shuffling enabled every traversal draws a fresh permutation from
/// (seed, epoch counter), so consecutive epochs see different orders while
/// a fixed seed keeps the whole run reproducible.
pub struct MinibatchIterator<'a> {
    partition: &'a Partition,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> MinibatchIterator<'a> {
    pub fn new(partition: &'a Partition, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        let mut iter = Self {
            partition,
            batch_size,
            shuffle,
            seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
        };
        iter.draw_order();
        iter
    }

    /// Traversals completed so far (the current epoch index).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn draw_order(&mut self) {
        self.order = (0..self.partition.len()).collect();
        if self.shuffle {
            let epoch_seed = self
                .seed
                .wrapping_add(self.epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut rng = StdRng::seed_from_u64(epoch_seed);
            self.order.shuffle(&mut rng);
        }
    }
}

impl BatchSource for MinibatchIterator<'_> {
    fn next_batch(&mut self) -> Result<Option<Minibatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let shape = self.partition.shape;
        let mut images = Vec::with_capacity(indices.len() * shape.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            images.extend_from_slice(self.partition.image(index));
            labels.push(i64::from(self.partition.labels[index]));
        }
        Ok(Some(Minibatch {
            images,
            labels,
            shape,
        }))
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.cursor = 0;
        self.draw_order();
    }

    fn num_batches(&self) -> Option<usize> {
        let n = self.partition.len();
        Some((n + self.batch_size - 1) / self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitConfig;
    use crate::data::{DatasetBuilder, Image, LabeledExample};

    fn partition(n: usize) -> Partition {
        let shape = ImageShape::new(1, 1, 2);
        let examples: Vec<LabeledExample> = (0..n)
            .map(|i| LabeledExample {
                image: Image::new(vec![i as f32, i as f32], shape),
                label: (i % 2) as u8,
                source: format!("img{i}"),
            })
            .collect();
        // All examples land in train with a degenerate split.
        let split = SplitConfig {
            train: 1.0,
            validation: 0.0,
            test: 0.0,
        };
        DatasetBuilder::new(split, 0)
            .unwrap()
            .build(examples)
            .unwrap()
            .train
    }

    fn drain(iter: &mut MinibatchIterator<'_>) -> Vec<Minibatch> {
        let mut batches = Vec::new();
        while let Some(batch) = iter.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn covers_partition_in_ceil_n_over_b_batches() {
        let part = partition(10);
        let mut iter = MinibatchIterator::new(&part, 3, false, 0);
        assert_eq!(iter.num_batches(), Some(4));

        let batches = drain(&mut iter);
        assert_eq!(batches.len(), 4);
        let sizes: Vec<usize> = batches.iter().map(Minibatch::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(sizes.iter().sum::<usize>(), 10);
    }

    #[test]
    fn unshuffled_traversal_keeps_insertion_order() {
        let part = partition(6);
        let mut iter = MinibatchIterator::new(&part, 4, false, 0);
        let batches = drain(&mut iter);
        let seen: Vec<f32> = batches
            .iter()
            .flat_map(|b| b.images.chunks(2).map(|row| row[0]).collect::<Vec<_>>())
            .collect();
        let expected: Vec<f32> = (0..6).map(|i| part.image(i)[0]).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn reshuffles_between_epochs_but_keeps_the_set() {
        let part = partition(64);
        let mut iter = MinibatchIterator::new(&part, 8, true, 7);

        let first: Vec<f32> = drain(&mut iter)
            .iter()
            .flat_map(|b| b.images.chunks(2).map(|row| row[0]).collect::<Vec<_>>())
            .collect();
        iter.reset();
        let second: Vec<f32> = drain(&mut iter)
            .iter()
            .flat_map(|b| b.images.chunks(2).map(|row| row[0]).collect::<Vec<_>>())
            .collect();

        assert_ne!(first, second, "consecutive epochs reused the same order");

        let mut a = first.clone();
        let mut b = second.clone();
        a.sort_by(f32::total_cmp);
        b.sort_by(f32::total_cmp);
        assert_eq!(a, b, "epochs must cover the same example set");
    }

    #[test]
    fn exhausted_iterator_restarts_after_reset() {
        let part = partition(5);
        let mut iter = MinibatchIterator::new(&part, 2, true, 3);
        assert_eq!(drain(&mut iter).len(), 3);
        assert!(iter.next_batch().unwrap().is_none());

        iter.reset();
        assert_eq!(iter.epoch(), 1);
        let batches = drain(&mut iter);
        assert_eq!(batches.iter().map(Minibatch::len).sum::<usize>(), 5);
    }

    #[test]
    fn labels_travel_with_their_images() {
        let part = partition(20);
        let mut iter = MinibatchIterator::new(&part, 6, true, 11);
        for batch in drain(&mut iter) {
            for (row, label) in batch.images.chunks(2).zip(&batch.labels) {
                // Construction labeled even indices 0, odd indices 1.
                assert_eq!(*label, (row[0] as i64) % 2);
            }
        }
    }
}
