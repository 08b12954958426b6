//! Batch generation for training and inference.

mod inference;
mod prefetch;
mod sequential;

pub use inference::*;
pub use prefetch::*;
pub use sequential::*;

use crate::{
    common::*,
    dataset::{PropagationExample, PropagationInput},
};

/// A sequence of batches that is traversed once per epoch.
pub trait BatchSequence {
    type Batch;

    /// Number of batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the batch at `index`, which must be less than [len](BatchSequence::len).
    fn get_batch(&self, index: usize) -> Result<Self::Batch>;

    /// Called once after each completed epoch.
    fn on_epoch_end(&mut self);
}

/// Batched network inputs.
#[derive(Debug)]
pub struct InputBatch {
    /// Flow fields in `[batch, 2, height, width]` shape.
    pub flow: Tensor,
    /// Previous masks in `[batch, 1, height, width]` shape.
    pub prev_mask: Tensor,
}

/// Batched network inputs and ground truth masks.
#[derive(Debug)]
pub struct TrainingBatch {
    pub input: InputBatch,
    /// Ground truth masks in `[batch, 1, height, width]` shape.
    pub target: Tensor,
}

impl InputBatch {
    pub fn batch_size(&self) -> i64 {
        self.flow.size()[0]
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            flow: self.flow.to_device(device),
            prev_mask: self.prev_mask.to_device(device),
        }
    }
}

impl TrainingBatch {
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            input: self.input.to_device(device),
            target: self.target.to_device(device),
        }
    }
}

impl InputBatch {
    /// Stacks single inputs along a new batch dimension.
    pub fn stack(inputs: Vec<PropagationInput>) -> Result<Self> {
        ensure!(!inputs.is_empty(), "cannot stack an empty list of inputs");
        let (flows, prev_masks): (Vec<_>, Vec<_>) = inputs
            .into_iter()
            .map(|PropagationInput { flow, prev_mask }| (flow, prev_mask))
            .unzip();

        Ok(Self {
            flow: Tensor::f_stack(&flows, 0)?,
            prev_mask: Tensor::f_stack(&prev_masks, 0)?,
        })
    }
}

impl TrainingBatch {
    /// Stacks labeled examples along a new batch dimension.
    pub fn stack(examples: Vec<PropagationExample>) -> Result<Self> {
        let (inputs, targets): (Vec<_>, Vec<_>) = examples
            .into_iter()
            .map(|PropagationExample { input, target }| (input, target))
            .unzip();

        Ok(Self {
            input: InputBatch::stack(inputs)?,
            target: Tensor::f_stack(&targets, 0)?,
        })
    }
}
