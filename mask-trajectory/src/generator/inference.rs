use super::*;
use crate::{common::*, dataset::InputSource, error::MaskTrajectoryError};

/// Produces input batches in source order, without ground truth.
///
/// The last batch holds the remaining inputs and may be smaller than the
/// batch size.
#[derive(Debug)]
pub struct InferenceBatchGenerator<S>
where
    S: InputSource,
{
    source: S,
    batch_size: usize,
}

impl<S> InferenceBatchGenerator<S>
where
    S: InputSource,
{
    pub fn new(source: S, batch_size: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        Ok(Self { source, batch_size })
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S> BatchSequence for InferenceBatchGenerator<S>
where
    S: InputSource,
{
    type Batch = InputBatch;

    fn len(&self) -> usize {
        let num_inputs = self.source.num_inputs();
        (num_inputs + self.batch_size - 1) / self.batch_size
    }

    fn get_batch(&self, index: usize) -> Result<InputBatch> {
        let len = self.len();
        if index >= len {
            return Err(MaskTrajectoryError::IndexOutOfRange { index, len }.into());
        }

        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.source.num_inputs());
        let inputs: Vec<_> = (start..end)
            .map(|input_index| self.source.input(input_index))
            .try_collect()?;

        InputBatch::stack(inputs)
    }

    fn on_epoch_end(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::sequential::tests::IndexedSource;

    #[test]
    fn keeps_the_remainder() -> Result<()> {
        let generator = InferenceBatchGenerator::new(IndexedSource { len: 7, size: 2 }, 3)?;
        assert_eq!(generator.len(), 3);

        let last = generator.get_batch(2)?;
        assert_eq!(last.batch_size(), 1);
        assert_eq!(f64::from(last.flow.mean(Kind::Float)), 6.0);

        let first = generator.get_batch(0)?;
        assert_eq!(first.prev_mask.size(), vec![3, 1, 2, 2]);
        assert!(generator.get_batch(3).is_err());
        Ok(())
    }
}
