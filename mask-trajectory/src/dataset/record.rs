use crate::common::*;

/// A video frame with its image and optional instance label image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRecord {
    pub source: String,
    pub id: String,
    pub image_path: PathBuf,
    pub mask_path: Option<PathBuf>,
}

impl FrameRecord {
    pub fn has_mask(&self) -> bool {
        self.mask_path.is_some()
    }
}
