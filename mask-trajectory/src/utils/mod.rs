//! Misc utilities.

mod rate_counter;
mod tensor;

pub use rate_counter::*;
pub use tensor::*;
