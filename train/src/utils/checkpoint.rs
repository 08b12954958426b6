use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_(\d{6})_\d+\.\d+\.ckpt$")
        .unwrap()
});

/// Save network weights to a checkpoint file.
pub fn save_checkpoint(
    model: &MaskTrajectory,
    checkpoint_dir: &Path,
    epoch: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        epoch,
        loss
    );
    let path = checkpoint_dir.join(filename);
    model.save_weights(&path)?;
    Ok(path)
}

/// Parses the timestamp and the epoch from a checkpoint file name.
pub fn parse_checkpoint_filename(file_name: &str) -> Option<(DateTime<chrono::FixedOffset>, usize)> {
    let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
    let datetime = DateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
    let epoch = captures.get(2)?.as_str().parse().ok()?;
    Some((datetime, epoch))
}

/// Load weights with specified checkpoint loading method.
///
/// Returns the epoch recorded in the checkpoint file name if any.
pub fn try_load_checkpoint(
    model: &MaskTrajectory,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<usize>> {
    let (path, by_name) = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            (None, false)
        }
        LoadCheckpoint::FromRecent => {
            let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
            let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;
            let checkpoint_file = paths
                .into_iter()
                .filter_map(|path| {
                    let file_name = path.file_name()?.to_str()?;
                    let (datetime, _) = parse_checkpoint_filename(file_name)?;
                    Some((path, datetime))
                })
                .max_by_key(|(_path, datetime)| *datetime)
                .map(|(path, _datetime)| path);

            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }

            (checkpoint_file, false)
        }
        LoadCheckpoint::FromFile { file, by_name } => {
            if file.is_file() {
                (Some(file.to_owned()), *by_name)
            } else {
                warn!("{} is not a file", file.display());
                (None, false)
            }
        }
    };

    let path = match path {
        Some(path) => path,
        None => return Ok(None),
    };

    info!("load checkpoint file {}", path.display());
    model.load_weights(&path, by_name)?;

    let epoch = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_checkpoint_filename)
        .map(|(_, epoch)| epoch);
    Ok(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoint_dir = dir.path().join("session").join("checkpoints");
        fs::create_dir_all(&checkpoint_dir)?;

        let init = MaskTrajectoryInit {
            base_channels: 2,
            ..MaskTrajectoryInit::new(Mode::Training)
        };
        let model = init.clone().build(Device::Cpu)?;
        let path = save_checkpoint(&model, &checkpoint_dir, 7, 0.25)?;

        let file_name = path.file_name().unwrap().to_str().unwrap();
        let (_, epoch) = parse_checkpoint_filename(file_name).unwrap();
        assert_eq!(epoch, 7);

        let fresh = init.build(Device::Cpu)?;
        let epoch = try_load_checkpoint(&fresh, dir.path(), &LoadCheckpoint::FromRecent)?;
        assert_eq!(epoch, Some(7));

        let epoch = try_load_checkpoint(&fresh, dir.path(), &LoadCheckpoint::Disabled)?;
        assert_eq!(epoch, None);
        Ok(())
    }
}
