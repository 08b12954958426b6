//! Mask propagation across video frames driven by optical flow.
//!
//! The crate decodes per-instance masks from densely packed label images,
//! indexes video frames, assembles (flow, previous mask, current mask)
//! training batches and trains a U-Net that predicts where an instance mask
//! moves to in the next frame.

mod common;
pub mod codec;
pub mod dataset;
pub mod error;
pub mod generator;
pub mod model;
pub mod taxonomy;
pub mod utils;

pub use error::MaskTrajectoryError;
