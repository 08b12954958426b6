//! Dataset loading for the training program.

use crate::{common::*, config::DatasetConfig};

const TRAIN_INDEX_FILE: &str = "train_index.bin";
const VALIDATION_INDEX_FILE: &str = "validation_index.bin";

/// Training and validation examples.
#[derive(Debug)]
pub struct Datasets {
    pub train: Arc<PropagationDataset>,
    pub validation: Arc<PropagationDataset>,
}

/// Builds the frame indexes, restoring them from the index cache if possible,
/// and scans them for propagation examples.
pub fn load_datasets(config: &DatasetConfig) -> Result<Datasets> {
    let DatasetConfig {
        root_dir,
        subset,
        mask_suffix,
        validation_fraction,
        seed,
        assume_match,
        index_cache,
        flow_dir,
        image_size,
    } = config;

    let template = VideoFrameIndex::wad()
        .with_seed(*seed)
        .with_mask_suffix(mask_suffix.as_str());

    let cached = index_cache.as_ref().and_then(|dir| {
        let train_file = dir.join(TRAIN_INDEX_FILE);
        let validation_file = dir.join(VALIDATION_INDEX_FILE);
        (train_file.is_file() && validation_file.is_file()).then(|| (train_file, validation_file))
    });

    let (train_index, validation_index) = match cached {
        Some((train_file, validation_file)) => {
            info!("restore frame index from '{}'", train_file.display());
            let mut train_index = template.empty_like();
            train_index.restore(&train_file)?;
            let mut validation_index = template.empty_like();
            validation_index.restore(&validation_file)?;
            (train_index, validation_index)
        }
        None => {
            let validation = template.empty_like();
            let (train_index, validation_index) = template
                .load_data(
                    root_dir,
                    subset,
                    true,
                    *assume_match,
                    validation_fraction.raw(),
                )?
                .into_parts();
            let validation_index = validation_index.unwrap_or(validation);

            if let Some(dir) = index_cache {
                fs::create_dir_all(dir)?;
                train_index.persist(dir.join(TRAIN_INDEX_FILE))?;
                validation_index.persist(dir.join(VALIDATION_INDEX_FILE))?;
                info!("saved frame index to '{}'", dir.display());
            }

            (train_index, validation_index)
        }
    };

    let flows = Arc::new(FloDirectory::new(flow_dir));
    let train = PropagationDataset::scan(Arc::new(train_index), flows.clone(), *image_size)?;
    let validation = PropagationDataset::scan(Arc::new(validation_index), flows, *image_size)?;

    Ok(Datasets {
        train: Arc::new(train),
        validation: Arc::new(validation),
    })
}
