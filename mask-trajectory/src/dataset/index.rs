use super::*;
use crate::{
    codec::{InstanceMaskCodec, InstanceMaskSet},
    common::*,
    error::MaskTrajectoryError,
    taxonomy::{ClassEntry, ClassTaxonomy, WAD_SOURCE},
};
use std::{
    ffi::OsString,
    fs::File,
    io::{BufReader, BufWriter, Write as _},
};

/// The default suffix appended to the image stem to name its label image.
pub const DEFAULT_MASK_SUFFIX: &str = "_instanceIds.png";

/// The default random seed for train/validation splitting.
pub const DEFAULT_SPLIT_SEED: u64 = 42;

static LABELED_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\\/\s,]+\.jpg).*?([^\\/\s,]+\.png)").unwrap());
static UNLABELED_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([0-9A-Za-z_]+)").unwrap());

/// Decodes the instance masks of frames.
pub trait MaskResolver
where
    Self: Debug + Send + Sync,
{
    fn resolve_record(&self, record: &FrameRecord) -> Result<InstanceMaskSet>;
}

/// The result of loading a directory of frames.
#[derive(Debug)]
pub enum LoadedIndex {
    Whole(VideoFrameIndex),
    Split {
        train: VideoFrameIndex,
        validation: VideoFrameIndex,
    },
}

impl LoadedIndex {
    /// Returns the training index and the validation index if the frames were split.
    pub fn into_parts(self) -> (VideoFrameIndex, Option<VideoFrameIndex>) {
        match self {
            Self::Whole(index) => (index, None),
            Self::Split { train, validation } => (train, Some(validation)),
        }
    }
}

/// An ordered collection of video frames from one dataset source.
///
/// Frames of other sources can be added as well. Their masks are resolved by
/// the fallback resolver.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct VideoFrameIndex {
    source: String,
    taxonomy: ClassTaxonomy,
    records: Vec<FrameRecord>,
    mask_suffix: String,
    seed: u64,
    #[derivative(Debug = "ignore")]
    fallback: Option<Arc<dyn MaskResolver>>,
}

impl VideoFrameIndex {
    pub fn new(source: impl Into<String>, taxonomy: ClassTaxonomy) -> Self {
        Self {
            source: source.into(),
            taxonomy,
            records: vec![],
            mask_suffix: DEFAULT_MASK_SUFFIX.to_string(),
            seed: DEFAULT_SPLIT_SEED,
            fallback: None,
        }
    }

    /// Creates an empty index for the WAD dataset.
    pub fn wad() -> Self {
        Self::new(WAD_SOURCE, ClassTaxonomy::wad())
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }

    pub fn with_mask_suffix(self, suffix: impl Into<String>) -> Self {
        Self {
            mask_suffix: suffix.into(),
            ..self
        }
    }

    /// Sets the resolver for frames whose source differs from this index.
    pub fn with_fallback(self, fallback: Arc<dyn MaskResolver>) -> Self {
        Self {
            fallback: Some(fallback),
            ..self
        }
    }

    /// Creates an empty index sharing the source, taxonomy and options.
    pub fn empty_like(&self) -> Self {
        Self {
            records: vec![],
            ..self.clone()
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn get(&self, frame: usize) -> Result<&FrameRecord> {
        let len = self.records.len();
        self.records
            .get(frame)
            .ok_or_else(|| MaskTrajectoryError::IndexOutOfRange { index: frame, len }.into())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finds the position of a frame by source and identifier.
    pub fn position(&self, source: &str, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.source == source && record.id == id)
    }

    pub fn codec(&self) -> InstanceMaskCodec<'_> {
        InstanceMaskCodec::new(&self.taxonomy, &self.source)
    }

    pub fn add_class(&mut self, entry: ClassEntry) -> Result<usize> {
        self.taxonomy.add(entry)
    }

    /// Appends a frame and returns its position.
    pub fn add_frame(
        &mut self,
        source: impl Into<String>,
        id: impl Into<String>,
        image_path: impl Into<PathBuf>,
        mask_path: Option<PathBuf>,
    ) -> usize {
        self.records.push(FrameRecord {
            source: source.into(),
            id: id.into(),
            image_path: image_path.into(),
            mask_path,
        });
        self.records.len() - 1
    }

    /// Loads all images in a directory, optionally reserving a validation split.
    ///
    /// When `mask_dir` is given, images without a label image are left out
    /// unless `assume_match` is set.
    pub fn load_from_directory(
        mut self,
        image_dir: impl AsRef<Path>,
        mask_dir: Option<&Path>,
        assume_match: bool,
        validation_fraction: f64,
    ) -> Result<LoadedIndex> {
        let image_dir = image_dir.as_ref();
        ensure!(
            (0.0..1.0).contains(&validation_fraction),
            "validation fraction must be in range [0, 1), but get {}",
            validation_fraction
        );

        let files = list_files(image_dir)?;

        if validation_fraction > 0.0 {
            let (train_files, validation_files) =
                split_files(files, validation_fraction, self.seed);

            let mut validation = self.empty_like();
            self.add_image_files(train_files, mask_dir, assume_match);
            validation.add_image_files(validation_files, mask_dir, assume_match);
            info!(
                "loaded {} training frames and {} validation frames from '{}'",
                self.len(),
                validation.len(),
                image_dir.display()
            );

            Ok(LoadedIndex::Split {
                train: self,
                validation,
            })
        } else {
            self.add_image_files(files, mask_dir, assume_match);
            info!(
                "loaded {} frames from '{}'",
                self.len(),
                image_dir.display()
            );
            Ok(LoadedIndex::Whole(self))
        }
    }

    /// Loads a subset of the dataset from `{subset}_color` and `{subset}_label` directories.
    pub fn load_data(
        self,
        root_dir: impl AsRef<Path>,
        subset: &str,
        labeled: bool,
        assume_match: bool,
        validation_fraction: f64,
    ) -> Result<LoadedIndex> {
        let root_dir = root_dir.as_ref();
        let image_dir = root_dir.join(format!("{}_color", subset));
        let mask_dir = root_dir.join(format!("{}_label", subset));

        ensure!(
            image_dir.is_dir(),
            "image directory '{}' does not exist",
            image_dir.display()
        );

        if labeled {
            ensure!(
                mask_dir.is_dir(),
                "mask directory '{}' does not exist",
                mask_dir.display()
            );
            self.load_from_directory(
                &image_dir,
                Some(&mask_dir),
                assume_match,
                validation_fraction,
            )
        } else {
            self.load_from_directory(&image_dir, None, assume_match, 0.0)
        }
    }

    /// Loads frames listed in a video list file and returns the number of added frames.
    ///
    /// Frames with missing images are skipped. Frames with missing label
    /// images are kept without a mask.
    pub fn load_video(
        &mut self,
        list_file: impl AsRef<Path>,
        image_dir: impl AsRef<Path>,
        mask_dir: Option<&Path>,
        assume_match: bool,
    ) -> Result<usize> {
        let list_file = list_file.as_ref();
        let image_dir = image_dir.as_ref();
        let text = fs::read_to_string(list_file)
            .with_context(|| format!("failed to read video list '{}'", list_file.display()))?;

        let mut count = 0;

        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let (id, image_file, mask_file) = match mask_dir {
                Some(_) => {
                    let captures = match LABELED_LINE_REGEX.captures(line) {
                        Some(captures) => captures,
                        None => {
                            warn!("ignore malformed line '{}' in '{}'", line, list_file.display());
                            continue;
                        }
                    };
                    let image_file = captures[1].to_string();
                    let mask_file = captures[2].to_string();
                    let id = image_file.trim_end_matches(".jpg").to_string();
                    (id, image_file, Some(mask_file))
                }
                None => {
                    let captures = match UNLABELED_LINE_REGEX.captures(line) {
                        Some(captures) => captures,
                        None => {
                            warn!("ignore malformed line '{}' in '{}'", line, list_file.display());
                            continue;
                        }
                    };
                    let id = captures[1].to_string();
                    let image_file = format!("{}.jpg", id);
                    (id, image_file, None)
                }
            };

            let image_path = image_dir.join(image_file);
            let mut mask_path = mask_dir
                .zip(mask_file)
                .map(|(dir, file)| dir.join(file));

            if !assume_match {
                if !image_path.is_file() {
                    warn!("skip frame '{}' without image file", id);
                    continue;
                }
                if matches!(&mask_path, Some(path) if !path.is_file()) {
                    mask_path = None;
                }
            }

            self.add_frame(self.source.clone(), id, image_path, mask_path);
            count += 1;
        }

        Ok(count)
    }

    /// Writes the frame records to a file.
    ///
    /// The records are written to a temporary file first and then renamed
    /// to the destination. The temporary file is removed if either step fails.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = {
            let mut name: OsString = path.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };

        let file = File::create(&tmp_path)
            .with_context(|| format!("failed to create '{}'", tmp_path.display()))?;

        let result = (|| -> Result<()> {
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &self.records)?;
            writer.flush()?;
            drop(writer);
            fs::rename(&tmp_path, path)
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            Ok(())
        })();

        if result.is_err() {
            if let Err(err) = fs::remove_file(&tmp_path) {
                warn!("failed to remove '{}': {}", tmp_path.display(), err);
            }
        }
        result
    }

    /// Replaces the frame records with the records saved in a file.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open frame index '{}'", path.display()))?;
        self.records = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("failed to parse frame index '{}'", path.display()))?;
        Ok(())
    }

    /// Returns the image path of a frame after checking that the file exists.
    pub fn image_path(&self, frame: usize) -> Result<&Path> {
        let path = &self.get(frame)?.image_path;
        ensure_file(path)?;
        Ok(path)
    }

    /// Decodes the instance masks of a frame.
    pub fn resolve_mask(&self, frame: usize) -> Result<InstanceMaskSet> {
        let record = self.get(frame)?;
        self.resolve_record(record)
    }

    fn add_image_files(
        &mut self,
        files: Vec<PathBuf>,
        mask_dir: Option<&Path>,
        assume_match: bool,
    ) -> usize {
        let mut num_skipped = 0;

        for image_path in files {
            let id = match image_path.file_stem().and_then(|stem| stem.to_str()) {
                Some(stem) => stem.to_string(),
                None => {
                    warn!("ignore non UTF-8 file name '{}'", image_path.display());
                    num_skipped += 1;
                    continue;
                }
            };
            let mask_path =
                mask_dir.map(|dir| dir.join(format!("{}{}", id, self.mask_suffix)));

            if !assume_match {
                let has_image = image_path.is_file();
                let has_mask = mask_path.as_ref().map(|path| path.is_file()).unwrap_or(true);

                if !has_image || !has_mask {
                    debug!("skip frame '{}'", id);
                    num_skipped += 1;
                    continue;
                }
            }

            self.add_frame(self.source.clone(), id, image_path, mask_path);
        }

        if num_skipped > 0 {
            info!("skipped {} frames without matching files", num_skipped);
        }

        num_skipped
    }

    fn decode_record(&self, record: &FrameRecord) -> Result<InstanceMaskSet> {
        let mask_path = record.mask_path.as_ref().ok_or_else(|| {
            Error::from(MaskTrajectoryError::MissingMask {
                id: record.id.clone(),
            })
        })?;
        ensure_file(mask_path)?;
        self.codec()
            .decode_file(mask_path)
            .with_context(|| format!("failed to decode mask of frame '{}'", record.id))
    }
}

impl MaskResolver for VideoFrameIndex {
    fn resolve_record(&self, record: &FrameRecord) -> Result<InstanceMaskSet> {
        if record.source == self.source {
            return self.decode_record(record);
        }

        match &self.fallback {
            Some(fallback) => fallback.resolve_record(record),
            None => bail!(
                "no mask resolver for frame '{}' of source '{}'",
                record.id,
                record.source
            ),
        }
    }
}

fn ensure_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(MaskTrajectoryError::MissingFile {
            path: path.to_owned(),
        }
        .into())
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list directory '{}'", dir.display()))?
        .map(|entry| -> Result<_> {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            Ok((!is_dir).then(|| entry.path()))
        })
        .filter_map(|result| result.transpose())
        .try_collect()?;
    files.sort();
    Ok(files)
}

/// Partitions files into training and validation parts.
///
/// `ceil(fraction * len)` files are drawn for validation. Both parts keep
/// the file name order.
fn split_files(mut files: Vec<PathBuf>, fraction: f64, seed: u64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let num_validation = ((files.len() as f64) * fraction).ceil() as usize;
    let num_validation = num_validation.min(files.len());

    let mut rng = StdRng::seed_from_u64(seed);
    files.shuffle(&mut rng);

    let mut train = files.split_off(num_validation);
    let mut validation = files;
    train.sort();
    validation.sort();

    (train, validation)
}
