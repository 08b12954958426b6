//! Video frame indexing and propagation samples.

mod flow;
mod index;
mod propagation;
mod record;

pub use flow::*;
pub use index::*;
pub use propagation::*;
pub use record::*;
