//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{DateTime, Local};
pub use itertools::Itertools;
pub use log::{info, warn};
pub use mask_trajectory::{
    dataset::{FloDirectory, LoadedIndex, PropagationDataset, VideoFrameIndex},
    generator::SequentialBatchGenerator,
    model::{EpochSummary, MaskLoss, MaskTrajectory, MaskTrajectoryInit, Mode, OptimizerConfig},
};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use structopt::StructOpt;
pub use tch::Device;

pub type Fallible<T> = Result<T, Error>;
