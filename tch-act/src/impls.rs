use crate::Activation;
use tch::{nn, Tensor};

impl nn::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        use Activation::*;

        match *self {
            Linear => xs.shallow_clone(),
            Logistic => xs.sigmoid(),
            Relu => xs.relu(),
            BoundedRelu { max } => bounded_relu(xs, max),
            Leaky => leaky(xs),
            Swish => swish(xs),
            Tanh => xs.tanh(),
        }
    }
}

pub fn bounded_relu(xs: &Tensor, max: f64) -> Tensor {
    xs.clamp(0.0, max)
}

pub fn leaky(xs: &Tensor) -> Tensor {
    xs.clamp_min(0.0) + xs.clamp_max(0.0) * 0.1
}

pub fn swish(tensor: &Tensor) -> Tensor {
    tensor * tensor.sigmoid()
}
