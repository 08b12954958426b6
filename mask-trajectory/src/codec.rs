//! Instance mask decoding from densely packed label images.
//!
//! Each pixel of a label image stores `class_code * 1000 + instance_number`.
//! Background pixels carry a sentinel value.

use crate::{common::*, taxonomy::ClassTaxonomy};
use image::DynamicImage;

pub const DEFAULT_BACKGROUND: u32 = 255;
pub const DEFAULT_CLASS_DIVISOR: u32 = 1000;

/// Per-instance masks decoded from a label image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMaskSet {
    /// Boolean masks in `(height, width, instances)` shape.
    pub masks: Array3<bool>,
    /// Dense class index of each instance.
    pub class_ids: Vec<usize>,
    /// Raw label value of each instance, in ascending order.
    pub instance_values: Vec<u32>,
}

impl InstanceMaskSet {
    pub fn empty(height: usize, width: usize) -> Self {
        Self {
            masks: Array3::from_elem((height, width, 0), false),
            class_ids: vec![],
            instance_values: vec![],
        }
    }

    pub fn num_instances(&self) -> usize {
        self.class_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_ids.is_empty()
    }

    pub fn height(&self) -> usize {
        self.masks.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.masks.shape()[1]
    }

    /// Finds the channel of an instance by its raw label value.
    pub fn position(&self, instance_value: u32) -> Option<usize> {
        self.instance_values.binary_search(&instance_value).ok()
    }

    /// Converts one instance mask to a `[1, height, width]` float tensor.
    pub fn mask_tensor(&self, channel: usize) -> Tensor {
        let height = self.height() as i64;
        let width = self.width() as i64;
        let values: Vec<f32> = self
            .masks
            .index_axis(Axis(2), channel)
            .iter()
            .map(|&on| if on { 1.0 } else { 0.0 })
            .collect();
        Tensor::of_slice(&values).view([1, height, width])
    }
}

/// Decodes label images into instance masks.
#[derive(Debug, Clone)]
pub struct InstanceMaskCodec<'a> {
    pub taxonomy: &'a ClassTaxonomy,
    pub source: &'a str,
    pub background: u32,
    pub class_divisor: u32,
}

impl<'a> InstanceMaskCodec<'a> {
    pub fn new(taxonomy: &'a ClassTaxonomy, source: &'a str) -> Self {
        Self {
            taxonomy,
            source,
            background: DEFAULT_BACKGROUND,
            class_divisor: DEFAULT_CLASS_DIVISOR,
        }
    }

    pub fn decode(&self, raw: ArrayView2<'_, u32>) -> Result<InstanceMaskSet> {
        let Self {
            taxonomy,
            source,
            background,
            class_divisor,
        } = *self;
        let (height, width) = raw.dim();

        let mut values: BTreeSet<u32> = raw.iter().cloned().collect();
        values.remove(&background);
        let instance_values: Vec<u32> = values.into_iter().collect();

        let class_ids: Vec<usize> = instance_values
            .iter()
            .map(|&value| taxonomy.try_dense_index(source, value / class_divisor))
            .try_collect()?;

        let channels: HashMap<u32, usize> = instance_values
            .iter()
            .enumerate()
            .map(|(channel, &value)| (value, channel))
            .collect();
        let mut masks = Array3::from_elem((height, width, instance_values.len()), false);
        raw.indexed_iter().for_each(|((row, col), value)| {
            if let Some(&channel) = channels.get(value) {
                masks[[row, col, channel]] = true;
            }
        });

        Ok(InstanceMaskSet {
            masks,
            class_ids,
            instance_values,
        })
    }

    pub fn decode_file(&self, path: impl AsRef<Path>) -> Result<InstanceMaskSet> {
        let raw = read_label_image(path)?;
        self.decode(raw.view())
    }

    /// Packs instance masks back to a label image. Uncovered pixels get the background value.
    pub fn encode(&self, set: &InstanceMaskSet) -> Array2<u32> {
        let mut raw = Array2::from_elem((set.height(), set.width()), self.background);
        set.instance_values
            .iter()
            .enumerate()
            .for_each(|(channel, &value)| {
                raw.iter_mut()
                    .zip(set.masks.index_axis(Axis(2), channel).iter())
                    .filter(|(_, &on)| on)
                    .for_each(|(pixel, _)| *pixel = value);
            });
        raw
    }
}

/// Reads an 8-bit or 16-bit single channel label image.
///
/// 8-bit values are widened without rescaling.
pub fn read_label_image(path: impl AsRef<Path>) -> Result<Array2<u32>> {
    let path = path.as_ref();
    let image = image::open(path)
        .with_context(|| format!("failed to read label image '{}'", path.display()))?;

    let (width, height, values): (u32, u32, Vec<u32>) = match image {
        DynamicImage::ImageLuma8(buf) => (
            buf.width(),
            buf.height(),
            buf.into_raw().into_iter().map(u32::from).collect(),
        ),
        DynamicImage::ImageLuma16(buf) => (
            buf.width(),
            buf.height(),
            buf.into_raw().into_iter().map(u32::from).collect(),
        ),
        _ => bail!(
            "label image '{}' is not a single channel 8-bit or 16-bit image",
            path.display()
        ),
    };

    let raw = Array2::from_shape_vec((height as usize, width as usize), values)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::MaskTrajectoryError, taxonomy::WAD_SOURCE};
    use ndarray::array;

    #[test]
    fn decode_instances() -> Result<()> {
        let taxonomy = ClassTaxonomy::wad();
        let codec = InstanceMaskCodec::new(&taxonomy, WAD_SOURCE);
        let raw = array![
            [255, 33001, 33001, 36000],
            [255, 33001, 36000, 36000],
            [33002, 255, 255, 255],
        ];

        let set = codec.decode(raw.view())?;
        assert_eq!(set.masks.dim(), (3, 4, 3));
        assert_eq!(set.instance_values, vec![33001, 33002, 36000]);
        assert_eq!(set.class_ids, vec![1, 1, 4]);

        for (channel, &value) in set.instance_values.iter().enumerate() {
            let expect = raw.iter().filter(|&&pixel| pixel == value).count();
            let found = set
                .masks
                .index_axis(Axis(2), channel)
                .iter()
                .filter(|&&on| on)
                .count();
            assert_eq!(expect, found);
        }
        assert!(set.masks[[2, 0, 1]]);
        assert!(!set.masks[[0, 0, 0]]);

        assert_eq!(codec.encode(&set), raw);
        Ok(())
    }

    #[test]
    fn decode_background_only() -> Result<()> {
        let taxonomy = ClassTaxonomy::wad();
        let codec = InstanceMaskCodec::new(&taxonomy, WAD_SOURCE);
        let raw = Array2::from_elem((5, 7), 255);

        let set = codec.decode(raw.view())?;
        assert!(set.is_empty());
        assert_eq!(set.masks.dim(), (5, 7, 0));
        assert!(set.instance_values.is_empty());
        Ok(())
    }

    #[test]
    fn decode_unknown_class() {
        let taxonomy = ClassTaxonomy::wad();
        let codec = InstanceMaskCodec::new(&taxonomy, WAD_SOURCE);
        let raw = array![[255, 2001], [33000, 255]];

        let err = codec.decode(raw.view()).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::UnknownClass { code: 2, .. })
        ));
    }

    #[test]
    fn read_wide_label_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("label.png");
        let buf = image::ImageBuffer::<image::Luma<u16>, _>::from_raw(
            2,
            2,
            vec![255u16, 33001, 40002, 255],
        )
        .unwrap();
        buf.save(&path)?;

        let raw = read_label_image(&path)?;
        assert_eq!(raw, array![[255, 33001], [40002, 255]]);

        let taxonomy = ClassTaxonomy::wad();
        let set = InstanceMaskCodec::new(&taxonomy, WAD_SOURCE).decode_file(&path)?;
        assert_eq!(set.class_ids, vec![1, 8]);
        assert_eq!(set.mask_tensor(1).size(), vec![1, 2, 2]);
        Ok(())
    }
}
