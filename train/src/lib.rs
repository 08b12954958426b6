//! The training program of the mask propagation network.

pub mod common;
pub mod config;
pub mod data;
pub mod logging;
pub mod utils;

use crate::{common::*, config::Config, logging::HistoryWriter};

/// The entry of training program.
pub fn start(config: Arc<Config>) -> Result<()> {
    let Config {
        model: model_config,
        training: training_config,
        logging: logging_config,
        dataset: dataset_config,
    } = &*config;
    ensure!(
        model_config.mode == Mode::Training,
        "the model must be built in training mode"
    );

    let start_time = Local::now();
    let logging_dir = logging_config
        .dir
        .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
    let checkpoint_dir = logging_dir.join("checkpoints");

    // create dirs and save config
    {
        fs::create_dir_all(&logging_dir)?;
        fs::create_dir_all(&checkpoint_dir)?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        fs::write(&path, text)?;
    }

    // load dataset
    info!("loading dataset");
    let data::Datasets { train, validation } = data::load_datasets(dataset_config)?;

    let batch_size = training_config.batch_size.get();
    let (mut train, mut validation) = match training_config.shuffle_seed {
        Some(seed) => (
            SequentialBatchGenerator::with_seed(train, batch_size, seed)?,
            SequentialBatchGenerator::with_seed(validation, batch_size, seed.wrapping_add(1))?,
        ),
        None => (
            SequentialBatchGenerator::new(train, batch_size)?,
            SequentialBatchGenerator::new(validation, batch_size)?,
        ),
    };

    // build model
    let mut model = model_config.clone().build(training_config.device)?;
    if let Some(epoch) =
        utils::try_load_checkpoint(&model, &logging_config.dir, &training_config.load_checkpoint)?
    {
        info!("resume from epoch {}", epoch);
        model.resume_epoch(epoch);
    }
    model.compile(&training_config.optimizer, training_config.loss.clone())?;

    // train
    let mut history = HistoryWriter::create(logging_dir.join("history.csv"))?;

    while model.epoch() < training_config.epochs {
        let summaries = model.train_epochs(
            &mut train,
            &mut validation,
            model.epoch() + 1,
            training_config.steps_per_epoch,
        )?;

        for summary in summaries {
            history.append(&summary)?;
            let loss = summary.val_loss.unwrap_or(summary.train_loss);
            let path = utils::save_checkpoint(&model, &checkpoint_dir, summary.epoch, loss)?;
            info!("saved checkpoint {}", path.display());
        }
    }

    Ok(())
}
