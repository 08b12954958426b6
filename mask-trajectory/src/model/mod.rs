//! The mask propagation network.

mod loss;
mod optimizer;
mod residual;
mod trajectory;
mod unet;
mod weights;

pub use loss::*;
pub use optimizer::*;
pub use residual::*;
pub use trajectory::*;
pub use unet::*;
pub use weights::*;

use crate::common::*;

/// The purpose the network is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Inference,
}

/// The network architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Variant {
    /// Full encoder/decoder emitting a probability mask.
    #[serde(rename = "unet")]
    UNet,
    /// A residual stage producing a feature map, meant to be composed into a detector.
    Residual(ResidualConfig),
}

impl Default for Variant {
    fn default() -> Self {
        Self::UNet
    }
}

/// Describes one resolution level of the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageInfo {
    pub name: String,
    pub channels: i64,
}

impl StageInfo {
    pub fn new(name: impl Into<String>, channels: i64) -> Self {
        Self {
            name: name.into(),
            channels,
        }
    }
}

/// Creates a same-padding convolution.
fn conv2d_same<'p>(path: impl Borrow<nn::Path<'p>>, in_c: i64, out_c: i64, k: i64) -> nn::Conv2D {
    nn::conv2d(
        path,
        in_c,
        out_c,
        k,
        nn::ConvConfig {
            padding: k / 2,
            ..Default::default()
        },
    )
}
