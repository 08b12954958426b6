//! Error kinds that callers are expected to tell apart.
//!
//! Functions in this crate return [anyhow::Result]. The variants below are
//! raised through it and can be recovered with
//! [downcast_ref](anyhow::Error::downcast_ref).

use crate::{common::*, model::Mode};

#[derive(Debug, thiserror::Error)]
pub enum MaskTrajectoryError {
    #[error("class code {code} of source '{source_tag}' is not in the taxonomy")]
    UnknownClass { source_tag: String, code: u32 },
    #[error("class {code} of source '{source_tag}' is already registered")]
    DuplicateClass { source_tag: String, code: u32 },
    #[error("index {index} is out of range, the length is {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("operation requires {expected:?} mode, but the network is built in {found:?} mode")]
    Mode { expected: Mode, found: Mode },
    /// Raised for a weight of incompatible shape. A positional restore from a
    /// checkpoint with a different number of tensors reports the name
    /// `<count>` and the tensor counts as one-element shapes.
    #[error("shape of weight '{name}' mismatches, expect {expected:?}, but found {found:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("file '{}' does not exist", path.display())]
    MissingFile { path: PathBuf },
    #[error("frame '{id}' has no mask")]
    MissingMask { id: String },
    #[error("the residual sub-network has no prediction head")]
    NoPredictionHead,
}

impl MaskTrajectoryError {
    /// Returns the error kind if the error is one of the crate errors.
    pub fn of(error: &Error) -> Option<&Self> {
        error.downcast_ref()
    }
}
