//! Mapping from raw dataset class codes to dense class indexes.

use crate::{common::*, error::MaskTrajectoryError};

/// The source tag of the WAD video segmentation dataset.
pub const WAD_SOURCE: &str = "WAD";

/// The dense index reserved for background.
pub const BACKGROUND_INDEX: usize = 0;

const WAD_CLASSES: &[(u32, &str)] = &[
    (33, "car"),
    (34, "motorcycle"),
    (35, "bicycle"),
    (36, "person"),
    (37, "rider"),
    (38, "truck"),
    (39, "bus"),
    (40, "tricycle"),
    (0, "others"),
    (1, "rover"),
    (17, "sky"),
    (161, "car_groups"),
    (162, "motorcycle_group"),
    (163, "bicycle_group"),
    (164, "person_group"),
    (165, "rider_group"),
    (166, "truck_group"),
    (167, "bus_group"),
    (168, "tricycle_group"),
    (49, "road"),
    (50, "sidewalk"),
    (65, "traffic_cone"),
    (66, "road_pile"),
    (67, "fence"),
    (81, "traffic_light"),
    (82, "pole"),
    (83, "traffic_sign"),
    (84, "wall"),
    (85, "dustbin"),
    (86, "billboard"),
    (97, "building"),
    (98, "bridge"),
    (99, "tunnel"),
    (100, "overpass"),
    (113, "vegetation"),
];

/// A registered class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassEntry {
    pub source: String,
    pub code: u32,
    pub name: String,
}

impl ClassEntry {
    pub fn new(source: impl Into<String>, code: u32, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            code,
            name: name.into(),
        }
    }
}

/// The class taxonomy.
///
/// Classes get contiguous 1-based dense indexes in registration order.
/// Index 0 is the background and never maps to a class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTaxonomy {
    entries: IndexMap<(String, u32), String>,
}

impl ClassTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The taxonomy of the WAD dataset.
    pub fn wad() -> Self {
        let mut taxonomy = Self::new();
        WAD_CLASSES.iter().for_each(|&(code, name)| {
            taxonomy
                .entries
                .insert((WAD_SOURCE.to_string(), code), name.to_string());
        });
        taxonomy
    }

    /// Registers a class and returns its dense index.
    pub fn add(&mut self, entry: ClassEntry) -> Result<usize> {
        let ClassEntry { source, code, name } = entry;
        let key = (source, code);

        if self.entries.contains_key(&key) {
            let (source_tag, code) = key;
            return Err(MaskTrajectoryError::DuplicateClass { source_tag, code }.into());
        }

        let (index, _) = self.entries.insert_full(key, name);
        Ok(index + 1)
    }

    /// Gets the dense index of a raw class code.
    pub fn dense_index(&self, source: &str, code: u32) -> Option<usize> {
        self.entries
            .get_index_of(&(source.to_string(), code))
            .map(|index| index + 1)
    }

    /// Gets the dense index of a raw class code, or fails with an unknown class error.
    pub fn try_dense_index(&self, source: &str, code: u32) -> Result<usize> {
        self.dense_index(source, code).ok_or_else(|| {
            MaskTrajectoryError::UnknownClass {
                source_tag: source.to_string(),
                code,
            }
            .into()
        })
    }

    pub fn entry(&self, dense_index: usize) -> Option<ClassEntry> {
        let index = dense_index.checked_sub(1)?;
        let ((source, code), name) = self.entries.get_index(index)?;
        Some(ClassEntry::new(source.clone(), *code, name.clone()))
    }

    pub fn raw_code(&self, dense_index: usize) -> Option<u32> {
        let index = dense_index.checked_sub(1)?;
        self.entries.get_index(index).map(|((_, code), _)| *code)
    }

    pub fn name(&self, dense_index: usize) -> Option<&str> {
        let index = dense_index.checked_sub(1)?;
        self.entries.get_index(index).map(|(_, name)| name.as_str())
    }

    /// Number of classes including the background.
    pub fn num_classes(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = ClassEntry> + '_ {
        self.entries
            .iter()
            .map(|((source, code), name)| ClassEntry::new(source.clone(), *code, name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wad_taxonomy_is_dense() {
        let taxonomy = ClassTaxonomy::wad();
        assert_eq!(taxonomy.num_classes(), 36);
        assert_eq!(taxonomy.dense_index(WAD_SOURCE, 33), Some(1));
        assert_eq!(taxonomy.dense_index(WAD_SOURCE, 0), Some(9));
        assert_eq!(taxonomy.dense_index(WAD_SOURCE, 113), Some(35));
        assert_eq!(taxonomy.dense_index(WAD_SOURCE, 2), None);
        assert_eq!(taxonomy.raw_code(BACKGROUND_INDEX), None);
        assert_eq!(taxonomy.name(4), Some("person"));

        let codes: HashSet<_> = (1..taxonomy.num_classes())
            .map(|index| taxonomy.raw_code(index).unwrap())
            .collect();
        assert_eq!(codes.len(), WAD_CLASSES.len());
    }

    #[test]
    fn duplicated_class_is_rejected() {
        let mut taxonomy = ClassTaxonomy::new();
        assert_eq!(taxonomy.add(ClassEntry::new("balloon", 1, "balloon")).unwrap(), 1);
        assert_eq!(taxonomy.add(ClassEntry::new("WAD", 1, "rover")).unwrap(), 2);

        let err = taxonomy
            .add(ClassEntry::new("balloon", 1, "other balloon"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaskTrajectoryError>(),
            Some(MaskTrajectoryError::DuplicateClass { code: 1, .. })
        ));
        assert_eq!(taxonomy.num_classes(), 3);
    }
}
