use super::*;
use crate::{
    common::*,
    utils::{resize_flow, resize_mask},
};

/// The network input of one example.
#[derive(Debug)]
pub struct PropagationInput {
    /// Flow field in `[2, height, width]` shape.
    pub flow: Tensor,
    /// Previous instance mask in `[1, height, width]` shape.
    pub prev_mask: Tensor,
}

/// The network input of one example together with its ground truth.
#[derive(Debug)]
pub struct PropagationExample {
    pub input: PropagationInput,
    /// Current instance mask in `[1, height, width]` shape.
    pub target: Tensor,
}

/// A random access collection of network inputs.
pub trait InputSource
where
    Self: Debug + Send + Sync,
{
    fn num_inputs(&self) -> usize;

    fn input(&self, index: usize) -> Result<PropagationInput>;
}

/// A random access collection of labeled examples.
pub trait SampleSource
where
    Self: Debug + Send + Sync,
{
    fn num_samples(&self) -> usize;

    fn sample(&self, index: usize) -> Result<PropagationExample>;
}

impl<T> InputSource for Arc<T>
where
    T: InputSource + ?Sized,
{
    fn num_inputs(&self) -> usize {
        (**self).num_inputs()
    }

    fn input(&self, index: usize) -> Result<PropagationInput> {
        (**self).input(index)
    }
}

impl<T> SampleSource for Arc<T>
where
    T: SampleSource + ?Sized,
{
    fn num_samples(&self) -> usize {
        (**self).num_samples()
    }

    fn sample(&self, index: usize) -> Result<PropagationExample> {
        (**self).sample(index)
    }
}

/// An instance tracked from one frame to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePair {
    pub prev: usize,
    pub curr: usize,
    /// The raw label value identifying the instance in both frames.
    pub instance: u32,
}

/// Examples built from consecutive frames of a frame index.
#[derive(Debug)]
pub struct PropagationDataset {
    index: Arc<VideoFrameIndex>,
    flow_source: Arc<dyn FlowSource>,
    pairs: Vec<FramePair>,
    labeled: bool,
    image_size: Option<(i64, i64)>,
}

impl PropagationDataset {
    /// Enumerates instances visible in consecutive frames.
    ///
    /// Two adjacent records form a pair if they share the source, both have
    /// masks and the flow source can provide the flow between them. Every
    /// instance value present in both masks becomes one example.
    pub fn scan(
        index: Arc<VideoFrameIndex>,
        flow_source: Arc<dyn FlowSource>,
        image_size: Option<(usize, usize)>,
    ) -> Result<Self> {
        Self::scan_pairs(index, flow_source, image_size, true)
    }

    /// Enumerates network inputs without looking at the current frames' masks.
    ///
    /// Two adjacent records of the same source form a pair if the previous
    /// one has a mask and the flow between them is available. Every instance
    /// of the previous mask becomes one input. The dataset serves
    /// [InputSource] only and has no labeled samples.
    pub fn scan_inputs(
        index: Arc<VideoFrameIndex>,
        flow_source: Arc<dyn FlowSource>,
        image_size: Option<(usize, usize)>,
    ) -> Result<Self> {
        Self::scan_pairs(index, flow_source, image_size, false)
    }

    fn scan_pairs(
        index: Arc<VideoFrameIndex>,
        flow_source: Arc<dyn FlowSource>,
        image_size: Option<(usize, usize)>,
        labeled: bool,
    ) -> Result<Self> {
        let records = index.records();
        let mut pairs = vec![];
        let mut num_missing_flows = 0;
        let mut cache: Option<(usize, Vec<u32>)> = None;

        for curr in 1..records.len() {
            let prev = curr - 1;
            let prev_record = &records[prev];
            let curr_record = &records[curr];

            if prev_record.source != curr_record.source
                || !prev_record.has_mask()
                || (labeled && !curr_record.has_mask())
            {
                continue;
            }
            if !flow_source.contains(prev_record, curr_record) {
                num_missing_flows += 1;
                continue;
            }

            let prev_values = match cache.take() {
                Some((frame, values)) if frame == prev => values,
                _ => index.resolve_mask(prev)?.instance_values,
            };
            let to_pair = |instance| FramePair {
                prev,
                curr,
                instance,
            };

            if labeled {
                let curr_values = index.resolve_mask(curr)?.instance_values;
                let shared: BTreeSet<u32> = prev_values.iter().cloned().collect();
                pairs.extend(
                    curr_values
                        .iter()
                        .filter(|value| shared.contains(value))
                        .map(|&instance| to_pair(instance)),
                );
                cache = Some((curr, curr_values));
            } else {
                pairs.extend(prev_values.iter().map(|&instance| to_pair(instance)));
            }
        }

        if num_missing_flows > 0 {
            warn!(
                "{} consecutive frame pairs are ignored due to missing flow fields",
                num_missing_flows
            );
        }
        info!(
            "found {} propagation {} in {} frames",
            pairs.len(),
            if labeled { "examples" } else { "inputs" },
            records.len()
        );

        Ok(Self {
            index,
            flow_source,
            pairs,
            labeled,
            image_size: image_size.map(|(h, w)| (h as i64, w as i64)),
        })
    }

    /// Whether the pairs carry ground truth masks of the current frames.
    pub fn is_labeled(&self) -> bool {
        self.labeled
    }

    pub fn pairs(&self) -> &[FramePair] {
        &self.pairs
    }

    pub fn index(&self) -> &VideoFrameIndex {
        &self.index
    }

    fn load(&self, index: usize, with_target: bool) -> Result<(PropagationInput, Option<Tensor>)> {
        let FramePair {
            prev,
            curr,
            instance,
        } = *self.pairs.get(index).ok_or_else(|| {
            Error::from(crate::error::MaskTrajectoryError::IndexOutOfRange {
                index,
                len: self.pairs.len(),
            })
        })?;

        let prev_record = self.index.get(prev)?;
        let curr_record = self.index.get(curr)?;

        let prev_set = self.index.resolve_mask(prev)?;
        let prev_channel = prev_set.position(instance).ok_or_else(|| {
            format_err!(
                "instance {} disappears from frame '{}'",
                instance,
                prev_record.id
            )
        })?;
        let prev_mask = prev_set.mask_tensor(prev_channel);

        let target = if with_target {
            let curr_set = self.index.resolve_mask(curr)?;
            let curr_channel = curr_set.position(instance).ok_or_else(|| {
                format_err!(
                    "instance {} disappears from frame '{}'",
                    instance,
                    curr_record.id
                )
            })?;
            Some(curr_set.mask_tensor(curr_channel))
        } else {
            None
        };

        let flow = self
            .flow_source
            .flow(prev_record, curr_record)
            .with_context(|| {
                format!(
                    "failed to load flow from frame '{}' to '{}'",
                    prev_record.id, curr_record.id
                )
            })?
            .to_kind(Kind::Float);

        let (height, width) = match self.image_size {
            Some(size) => size,
            None => {
                let (_, height, width) = prev_mask.size3()?;
                (height, width)
            }
        };

        let input = PropagationInput {
            flow: resize_flow(&flow, height, width)?,
            prev_mask: resize_mask(&prev_mask, height, width)?,
        };
        let target = target
            .map(|target| resize_mask(&target, height, width))
            .transpose()?;

        Ok((input, target))
    }
}

impl SampleSource for PropagationDataset {
    fn num_samples(&self) -> usize {
        if self.labeled {
            self.pairs.len()
        } else {
            0
        }
    }

    fn sample(&self, index: usize) -> Result<PropagationExample> {
        if !self.labeled {
            return Err(crate::error::MaskTrajectoryError::IndexOutOfRange {
                index,
                len: 0,
            }
            .into());
        }
        let (input, target) = self.load(index, true)?;
        let target = target.ok_or_else(|| format_err!("target mask is not loaded"))?;
        Ok(PropagationExample { input, target })
    }
}

impl InputSource for PropagationDataset {
    fn num_inputs(&self) -> usize {
        self.pairs.len()
    }

    fn input(&self, index: usize) -> Result<PropagationInput> {
        let (input, _) = self.load(index, false)?;
        Ok(input)
    }
}
