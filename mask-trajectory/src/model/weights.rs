use crate::{common::*, error::MaskTrajectoryError};

/// The weight name reported when a checkpoint has a different number of tensors.
pub const WEIGHT_COUNT_NAME: &str = "<count>";

/// Variables of a network in the order their layers are applied.
///
/// Checkpoints store each tensor under `"{position:04}#{name}"`, so that
/// they can be restored either positionally or by variable name.
#[derive(Debug)]
pub struct WeightRegistry {
    entries: Vec<(String, Tensor)>,
}

impl WeightRegistry {
    /// Collects the variables of `vs` grouped by layer.
    ///
    /// Variables of one layer are sorted by name. Every variable must belong
    /// to one of the layers.
    pub fn collect(vs: &nn::VarStore, layer_names: &[String]) -> Result<Self> {
        let variables = vs.variables();
        let mut entries = Vec::with_capacity(variables.len());

        for layer in layer_names {
            let prefix = format!("{}.", layer);
            let mut names: Vec<_> = variables
                .keys()
                .filter(|name| name.starts_with(&prefix))
                .cloned()
                .collect();
            ensure!(!names.is_empty(), "layer '{}' has no variables", layer);
            names.sort();

            entries.extend(names.into_iter().map(|name| {
                let tensor = variables[&name].shallow_clone();
                (name, tensor)
            }));
        }

        ensure!(
            entries.len() == variables.len(),
            "{} variables do not belong to any listed layer",
            variables.len() - entries.len()
        );

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let named: Vec<_> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, (name, tensor))| (format!("{:04}#{}", position, name), tensor))
            .collect();
        Tensor::save_multi(&named, path)
            .with_context(|| format!("failed to save weights to '{}'", path.display()))?;
        Ok(())
    }

    /// Restores variables from a checkpoint and returns the number of restored tensors.
    ///
    /// Positional restoration requires the checkpoint to have exactly as many
    /// tensors as the network, otherwise it fails with a
    /// [WeightShapeMismatch](MaskTrajectoryError::WeightShapeMismatch) named
    /// [WEIGHT_COUNT_NAME]. Restoration by name skips variables missing in
    /// the checkpoint. Shapes are verified before any variable is modified.
    pub fn load(&self, path: impl AsRef<Path>, by_name: bool) -> Result<usize> {
        let path = path.as_ref();
        let loaded = Tensor::load_multi(path)
            .with_context(|| format!("failed to load weights from '{}'", path.display()))?;

        let mut loaded: Vec<(usize, String, Tensor)> = loaded
            .into_iter()
            .map(|(key, tensor)| -> Result<_> {
                let (position, name) = parse_key(&key)?;
                Ok((position, name.to_string(), tensor))
            })
            .try_collect()?;
        loaded.sort_by_key(|(position, _, _)| *position);

        let pairs: Vec<(&str, &Tensor, Tensor)> = if by_name {
            let mut by_names: HashMap<String, Tensor> = loaded
                .into_iter()
                .map(|(_, name, tensor)| (name, tensor))
                .collect();
            let pairs: Vec<_> = self
                .entries
                .iter()
                .filter_map(|(name, dst)| {
                    let src = by_names.remove(name)?;
                    Some((name.as_str(), dst, src))
                })
                .collect();

            let num_missing = self.entries.len() - pairs.len();
            if num_missing > 0 {
                warn!(
                    "{} variables are not found in '{}' and keep their values",
                    num_missing,
                    path.display()
                );
            }
            if !by_names.is_empty() {
                warn!(
                    "{} tensors in '{}' match no variable",
                    by_names.len(),
                    path.display()
                );
            }
            pairs
        } else {
            // a checkpoint with a different number of tensors is reported
            // as a shape mismatch of the whole weight list
            if loaded.len() != self.entries.len() {
                return Err(MaskTrajectoryError::WeightShapeMismatch {
                    name: WEIGHT_COUNT_NAME.to_string(),
                    expected: vec![self.entries.len() as i64],
                    found: vec![loaded.len() as i64],
                }
                .into());
            }
            self.entries
                .iter()
                .zip(loaded)
                .map(|((name, dst), (_, _, src))| (name.as_str(), dst, src))
                .collect()
        };

        for (name, dst, src) in &pairs {
            if dst.size() != src.size() {
                return Err(MaskTrajectoryError::WeightShapeMismatch {
                    name: name.to_string(),
                    expected: dst.size(),
                    found: src.size(),
                }
                .into());
            }
        }

        tch::no_grad(|| {
            for (_, dst, src) in &pairs {
                dst.shallow_clone().copy_(src);
            }
        });

        debug!("restored {} tensors from '{}'", pairs.len(), path.display());
        Ok(pairs.len())
    }
}

fn parse_key(key: &str) -> Result<(usize, &str)> {
    let (position, name) = key
        .split_once('#')
        .ok_or_else(|| format_err!("invalid weight entry '{}'", key))?;
    let position: usize = position
        .parse()
        .with_context(|| format!("invalid position in weight entry '{}'", key))?;
    Ok((position, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(vs: &nn::VarStore, width: i64) -> Vec<String> {
        let root = vs.root();
        let _ = nn::linear(&root / "first", 2, width, Default::default());
        let _ = nn::batch_norm1d(&root / "norm", width, Default::default());
        let _ = nn::linear(&root / "second", width, 1, Default::default());
        vec!["first".into(), "norm".into(), "second".into()]
    }

    #[test]
    fn registry_follows_layer_order() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let layers = build(&vs, 3);
        let registry = WeightRegistry::collect(&vs, &layers)?;

        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            [
                "first.bias",
                "first.weight",
                "norm.bias",
                "norm.running_mean",
                "norm.running_var",
                "norm.weight",
                "second.bias",
                "second.weight",
            ]
        );
        assert!(WeightRegistry::collect(&vs, &layers[..2]).is_err());
        Ok(())
    }

    #[test]
    fn restore_positionally_and_by_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.ot");

        let src_vs = nn::VarStore::new(Device::Cpu);
        let src = WeightRegistry::collect(&src_vs, &build(&src_vs, 3))?;
        src.save(&path)?;

        for by_name in [false, true] {
            let dst_vs = nn::VarStore::new(Device::Cpu);
            let dst = WeightRegistry::collect(&dst_vs, &build(&dst_vs, 3))?;
            assert_eq!(dst.load(&path, by_name)?, 8);

            for name in src.names() {
                let lhs = src.get(name).unwrap();
                let rhs = dst.get(name).unwrap();
                assert!(bool::from(lhs.eq_tensor(rhs).all()), "{} differs", name);
            }
        }
        Ok(())
    }

    #[test]
    fn reject_incompatible_checkpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.ot");

        let src_vs = nn::VarStore::new(Device::Cpu);
        WeightRegistry::collect(&src_vs, &build(&src_vs, 3))?.save(&path)?;

        let dst_vs = nn::VarStore::new(Device::Cpu);
        let dst = WeightRegistry::collect(&dst_vs, &build(&dst_vs, 4))?;
        let before = dst.get("second.weight").unwrap().copy();

        for by_name in [false, true] {
            let err = dst.load(&path, by_name).unwrap_err();
            assert!(matches!(
                MaskTrajectoryError::of(&err),
                Some(MaskTrajectoryError::WeightShapeMismatch { .. })
            ));
        }
        assert!(bool::from(
            dst.get("second.weight").unwrap().eq_tensor(&before).all()
        ));

        let fewer_vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(&fewer_vs.root() / "first", 2, 3, Default::default());
        let fewer = WeightRegistry::collect(&fewer_vs, &["first".to_string()])?;
        let err = fewer.load(&path, false).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::WeightShapeMismatch { name, expected, found })
                if name == WEIGHT_COUNT_NAME && expected == &[2] && found == &[8]
        ));
        assert_eq!(fewer.load(&path, true)?, 2);
        Ok(())
    }
}
