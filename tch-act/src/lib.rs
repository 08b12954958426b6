#[cfg(feature = "tch")]
pub use impls::*;
#[cfg(feature = "tch")]
mod impls;

#[cfg(feature = "tch")]
pub use r#trait::*;
#[cfg(feature = "tch")]
mod r#trait;

/// The default ceiling of [Activation::BoundedRelu].
pub const DEFAULT_RELU_MAX: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Linear,
    Logistic,
    Relu,
    /// ReLU clamped from above at `max`.
    BoundedRelu {
        max: f64,
    },
    Leaky,
    Swish,
    Tanh,
}

impl Activation {
    pub fn relu6() -> Self {
        Self::BoundedRelu {
            max: DEFAULT_RELU_MAX,
        }
    }
}
