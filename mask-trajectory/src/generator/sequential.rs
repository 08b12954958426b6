use super::*;
use crate::{common::*, dataset::SampleSource, error::MaskTrajectoryError};

/// Produces fixed-size training batches in a per-epoch shuffled order.
///
/// Examples that do not fill a whole batch at the end of the epoch order
/// are left out of that epoch.
#[derive(Debug)]
pub struct SequentialBatchGenerator<S>
where
    S: SampleSource,
{
    source: S,
    batch_size: usize,
    epoch_order: Vec<usize>,
    rng: StdRng,
}

impl<S> SequentialBatchGenerator<S>
where
    S: SampleSource,
{
    pub fn new(source: S, batch_size: usize) -> Result<Self> {
        Self::with_rng(source, batch_size, StdRng::from_entropy())
    }

    /// Creates a generator whose epoch orders are reproducible.
    pub fn with_seed(source: S, batch_size: usize, seed: u64) -> Result<Self> {
        Self::with_rng(source, batch_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(source: S, batch_size: usize, rng: StdRng) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");

        let epoch_order = (0..source.num_samples()).collect();
        let mut generator = Self {
            source,
            batch_size,
            epoch_order,
            rng,
        };
        generator.shuffle();

        Ok(generator)
    }

    pub fn epoch_order(&self) -> &[usize] {
        &self.epoch_order
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn shuffle(&mut self) {
        let Self {
            source,
            epoch_order,
            rng,
            ..
        } = self;

        *epoch_order = (0..source.num_samples()).collect();
        epoch_order.shuffle(rng);
    }
}

impl<S> BatchSequence for SequentialBatchGenerator<S>
where
    S: SampleSource,
{
    type Batch = TrainingBatch;

    fn len(&self) -> usize {
        self.epoch_order.len() / self.batch_size
    }

    fn get_batch(&self, index: usize) -> Result<TrainingBatch> {
        let len = self.len();
        if index >= len {
            return Err(MaskTrajectoryError::IndexOutOfRange { index, len }.into());
        }

        let start = index * self.batch_size;
        let end = start + self.batch_size;
        let examples: Vec<_> = self.epoch_order[start..end]
            .iter()
            .map(|&sample_index| self.source.sample(sample_index))
            .try_collect()?;

        TrainingBatch::stack(examples)
    }

    fn on_epoch_end(&mut self) {
        self.shuffle();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::{InputSource, PropagationInput};

    /// Examples filled with their own index.
    #[derive(Debug)]
    pub struct IndexedSource {
        pub len: usize,
        pub size: i64,
    }

    impl SampleSource for IndexedSource {
        fn num_samples(&self) -> usize {
            self.len
        }

        fn sample(&self, index: usize) -> Result<PropagationExample> {
            ensure!(index < self.len, "invalid index {}", index);
            let size = self.size;
            let value = index as f64;
            Ok(PropagationExample {
                input: PropagationInput {
                    flow: Tensor::full(&[2, size, size], value, FLOAT_CPU),
                    prev_mask: Tensor::full(&[1, size, size], value, FLOAT_CPU),
                },
                target: Tensor::full(&[1, size, size], value, FLOAT_CPU),
            })
        }
    }

    impl InputSource for IndexedSource {
        fn num_inputs(&self) -> usize {
            self.len
        }

        fn input(&self, index: usize) -> Result<PropagationInput> {
            Ok(self.sample(index)?.input)
        }
    }

    fn first_values(tensor: &Tensor) -> Vec<usize> {
        let batch_size = tensor.size()[0];
        (0..batch_size)
            .map(|index| f64::from(tensor.get(index).mean(Kind::Float)) as usize)
            .collect()
    }

    #[test]
    fn batches_follow_epoch_order() -> Result<()> {
        let source = IndexedSource { len: 10, size: 2 };
        let generator = SequentialBatchGenerator::with_seed(source, 3, 1)?;
        assert_eq!(generator.len(), 3);

        let batch = generator.get_batch(1)?;
        assert_eq!(batch.input.flow.size(), vec![3, 2, 2, 2]);
        assert_eq!(batch.input.prev_mask.size(), vec![3, 1, 2, 2]);
        assert_eq!(batch.target.size(), vec![3, 1, 2, 2]);
        assert_eq!(first_values(&batch.target), generator.epoch_order()[3..6]);
        assert_eq!(first_values(&batch.input.flow), generator.epoch_order()[3..6]);

        let err = generator.get_batch(3).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::IndexOutOfRange { index: 3, len: 3 })
        ));
        Ok(())
    }

    #[test]
    fn epoch_end_reshuffles() -> Result<()> {
        let source = IndexedSource { len: 64, size: 1 };
        let mut generator = SequentialBatchGenerator::with_seed(source, 8, 7)?;
        let before = generator.epoch_order().to_vec();

        generator.on_epoch_end();
        let after = generator.epoch_order().to_vec();
        assert_ne!(before, after);

        let mut sorted = after;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn same_seed_same_order() -> Result<()> {
        let make = || {
            SequentialBatchGenerator::with_seed(IndexedSource { len: 32, size: 1 }, 4, 11)
        };
        let mut lhs = make()?;
        let mut rhs = make()?;
        lhs.on_epoch_end();
        rhs.on_epoch_end();
        assert_eq!(lhs.epoch_order(), rhs.epoch_order());
        Ok(())
    }

    #[test]
    fn reject_zero_batch_size() {
        assert!(SequentialBatchGenerator::new(IndexedSource { len: 4, size: 1 }, 0).is_err());
    }

    #[test]
    fn short_source_has_no_batches() -> Result<()> {
        let generator = SequentialBatchGenerator::new(IndexedSource { len: 3, size: 1 }, 4)?;
        assert_eq!(generator.len(), 0);
        assert!(generator.is_empty());
        assert!(generator.get_batch(0).is_err());
        Ok(())
    }
}
