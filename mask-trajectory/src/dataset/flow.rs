use super::*;
use crate::{common::*, error::MaskTrajectoryError};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write as _},
};

/// The magic number at the head of Middlebury `.flo` files.
pub const FLO_MAGIC: f32 = 202021.25;

/// Bytes of the magic number, the width and the height.
const FLO_HEADER_LEN: u64 = 12;

/// Provides dense optical flow between two consecutive frames.
pub trait FlowSource
where
    Self: Debug + Send + Sync,
{
    /// Checks whether the flow between the frames is available.
    fn contains(&self, _prev: &FrameRecord, _curr: &FrameRecord) -> bool {
        true
    }

    /// Returns the flow field in `[2, height, width]` shape.
    fn flow(&self, prev: &FrameRecord, curr: &FrameRecord) -> Result<Tensor>;
}

/// Precomputed flow fields stored as `{prev_id}_{curr_id}.flo` files.
#[derive(Debug, Clone)]
pub struct FloDirectory {
    dir: PathBuf,
}

impl FloDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_of(&self, prev: &FrameRecord, curr: &FrameRecord) -> PathBuf {
        self.dir.join(format!("{}_{}.flo", prev.id, curr.id))
    }
}

impl FlowSource for FloDirectory {
    fn contains(&self, prev: &FrameRecord, curr: &FrameRecord) -> bool {
        self.path_of(prev, curr).is_file()
    }

    fn flow(&self, prev: &FrameRecord, curr: &FrameRecord) -> Result<Tensor> {
        let path = self.path_of(prev, curr);
        if !path.is_file() {
            return Err(MaskTrajectoryError::MissingFile { path }.into());
        }
        read_flo(&path)
    }
}

/// Reads a `.flo` file into a `[2, height, width]` tensor.
pub fn read_flo(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let magic = reader.read_f32::<LittleEndian>()?;
    ensure!(
        magic == FLO_MAGIC,
        "'{}' is not a flo file, the magic number is {}",
        path.display(),
        magic
    );
    let width = reader.read_i32::<LittleEndian>()?;
    let height = reader.read_i32::<LittleEndian>()?;
    ensure!(
        width > 0 && height > 0,
        "invalid flow size {}x{} in '{}'",
        width,
        height,
        path.display()
    );


    // header, then two f32 values per pixel
    let expect_len = (width as u64)
        .checked_mul(height as u64)
        .and_then(|num_pixels| num_pixels.checked_mul(8))
        .and_then(|num_bytes| num_bytes.checked_add(FLO_HEADER_LEN));
    ensure!(
        expect_len == Some(file_len),
        "the flow size {}x{} in '{}' does not match the file length {}",
        width,
        height,
        path.display(),
        file_len
    );

    let mut values = vec![0f32; width as usize * height as usize * 2];
    reader
        .read_f32_into::<LittleEndian>(&mut values)
        .with_context(|| format!("truncated flo file '{}'", path.display()))?;

    let flow = Tensor::of_slice(&values)
        .view([height as i64, width as i64, 2])
        .permute(&[2, 0, 1])
        .contiguous();
    Ok(flow)
}

/// Writes a `[2, height, width]` tensor to a `.flo` file.
pub fn write_flo(path: impl AsRef<Path>, flow: &Tensor) -> Result<()> {
    let path = path.as_ref();
    let (channels, height, width) = flow.size3()?;
    ensure!(
        channels == 2,
        "expect a flow field with 2 channels, but get {}",
        channels
    );

    let values = Vec::<f32>::from(
        &flow
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .permute(&[1, 2, 0])
            .contiguous(),
    );

    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("failed to create '{}'", path.display()))?,
    );
    writer.write_f32::<LittleEndian>(FLO_MAGIC)?;
    writer.write_i32::<LittleEndian>(width as i32)?;
    writer.write_i32::<LittleEndian>(height as i32)?;
    values
        .iter()
        .try_for_each(|&value| writer.write_f32::<LittleEndian>(value))?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flo_file_keeps_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("flow.flo");
        let flow = Tensor::of_slice(&[1f32, 2., 3., 4., 5., 6., 7., 8., 9., 10., 11., 12.])
            .view([2, 2, 3]);

        write_flo(&path, &flow)?;
        let bytes = fs::read(&path)?;
        assert_eq!(bytes.len(), 12 + 12 * 4);

        let loaded = read_flo(&path)?;
        assert_eq!(loaded.size(), vec![2, 2, 3]);
        assert_eq!(Vec::<f32>::from(&loaded), Vec::<f32>::from(&flow));
        Ok(())
    }

    #[test]
    fn reject_corrupt_flo_header() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let forge = |name: &str, width: i32, height: i32, num_values: usize| -> Result<PathBuf> {
            let path = dir.path().join(name);
            let mut writer = BufWriter::new(File::create(&path)?);
            writer.write_f32::<LittleEndian>(FLO_MAGIC)?;
            writer.write_i32::<LittleEndian>(width)?;
            writer.write_i32::<LittleEndian>(height)?;
            (0..num_values).try_for_each(|_| writer.write_f32::<LittleEndian>(0.0))?;
            writer.flush()?;
            Ok(path)
        };

        assert!(read_flo(forge("huge.flo", i32::MAX, i32::MAX, 4)?).is_err());
        assert!(read_flo(forge("truncated.flo", 3, 2, 11)?).is_err());
        assert!(read_flo(forge("trailing.flo", 3, 2, 13)?).is_err());
        assert!(read_flo(forge("negative.flo", -1, 2, 4)?).is_err());
        assert_eq!(read_flo(forge("exact.flo", 3, 2, 12)?)?.size(), vec![2, 2, 3]);
        Ok(())
    }

    #[test]
    fn flo_directory_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let flows = FloDirectory::new(dir.path());
        let record = |id: &str| FrameRecord {
            source: "WAD".into(),
            id: id.into(),
            image_path: format!("{}.jpg", id).into(),
            mask_path: None,
        };

        assert!(!flows.contains(&record("a"), &record("b")));
        let err = flows.flow(&record("a"), &record("b")).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::MissingFile { .. })
        ));
    }
}
