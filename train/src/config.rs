//! Training program configuration format.

use crate::common::*;
use mask_trajectory::dataset::{DEFAULT_MASK_SUFFIX, DEFAULT_SPLIT_SEED};

pub use dataset::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: MaskTrajectoryInit,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory containing `{subset}_color` and `{subset}_label` directories.
        pub root_dir: PathBuf,
        #[serde(default = "default_subset")]
        pub subset: String,
        /// The suffix appended to image file stems to name label images.
        #[serde(default = "default_mask_suffix")]
        pub mask_suffix: String,
        /// The fraction of frames reserved for validation.
        pub validation_fraction: R64,
        /// The random seed of the validation split.
        #[serde(default = "default_seed")]
        pub seed: u64,
        /// If set, skip file existence checks while loading.
        #[serde(default)]
        pub assume_match: bool,
        /// If set, the frame index is saved to and restored from this directory.
        pub index_cache: Option<PathBuf>,
        /// The directory of `{prev_id}_{curr_id}.flo` flow files.
        pub flow_dir: PathBuf,
        /// Optional `(height, width)` every sample is resized to.
        pub image_size: Option<(usize, usize)>,
    }

    fn default_subset() -> String {
        "train".into()
    }

    fn default_mask_suffix() -> String {
        DEFAULT_MASK_SUFFIX.into()
    }

    fn default_seed() -> u64 {
        DEFAULT_SPLIT_SEED
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// The total number of epochs.
        pub epochs: usize,
        /// Number of batches per epoch. The whole training set is used if absent.
        pub steps_per_epoch: Option<usize>,
        /// Optional seed of epoch shuffling.
        pub shuffle_seed: Option<u64>,
        pub optimizer: OptimizerConfig,
        #[serde(default)]
        pub loss: MaskLoss,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// Training device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile {
            file: PathBuf,
            /// Match weights by name rather than by position.
            #[serde(default)]
            by_name: bool,
        },
    }
}
