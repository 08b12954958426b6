use crate::common::*;

/// Per-pixel loss between predicted probabilities and ground truth masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskLoss {
    /// Binary cross-entropy. Foreground pixels are scaled by `pos_weight` if set.
    BinaryCrossEntropy {
        #[serde(default)]
        pos_weight: Option<R64>,
    },
    /// Squared error.
    L2,
}

impl Default for MaskLoss {
    fn default() -> Self {
        Self::BinaryCrossEntropy { pos_weight: None }
    }
}

impl MaskLoss {
    /// Computes the mean loss over all pixels.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target tensors must have equal shape, but get {:?} and {:?}",
            input.size(),
            target.size()
        );

        // return zero tensor if input is empty
        if input.numel() == 0 {
            return Ok(
                Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false)
            );
        }

        let loss = match *self {
            Self::BinaryCrossEntropy { pos_weight: None } => {
                input.binary_cross_entropy::<Tensor>(target, None, Reduction::Mean)
            }
            Self::BinaryCrossEntropy {
                pos_weight: Some(pos_weight),
            } => {
                let weight = target * (pos_weight.raw() - 1.0) + 1.0;
                input.binary_cross_entropy(target, Some(&weight), Reduction::Mean)
            }
            Self::L2 => {
                let diff = input - target;
                (&diff * &diff).mean(Kind::Float)
            }
        };

        Ok(loss)
    }
}
