use super::*;
use crate::{
    common::*,
    error::MaskTrajectoryError,
    generator::{run_epoch, BatchSequence, InputBatch, PrefetchConfig, TrainingBatch},
    utils::RateCounter,
};

/// Channels of the concatenated flow field and mask.
const INPUT_CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskTrajectoryInit {
    pub mode: Mode,
    #[serde(default)]
    pub variant: Variant,
    /// Activation after each U-Net convolution.
    #[serde(default = "Activation::relu6")]
    pub activation: Activation,
    /// Channels of the first U-Net stage.
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    /// Number of validation batches per epoch. The whole validation set is used if absent.
    #[serde(default)]
    pub validation_steps: Option<usize>,
    /// Checkpoint restored positionally after the network is built.
    #[serde(default)]
    pub weights_file: Option<PathBuf>,
}

fn default_base_channels() -> usize {
    64
}

impl MaskTrajectoryInit {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            variant: Variant::UNet,
            activation: Activation::relu6(),
            base_channels: default_base_channels(),
            prefetch: PrefetchConfig::default(),
            validation_steps: None,
            weights_file: None,
        }
    }

    pub fn build(self, device: Device) -> Result<MaskTrajectory> {
        let Self {
            mode,
            variant,
            activation,
            base_channels,
            prefetch,
            validation_steps,
            weights_file,
        } = self;
        ensure!(base_channels > 0, "base_channels must be positive");
        if let Activation::BoundedRelu { max } = activation {
            ensure!(max > 0.0, "the ceiling of bounded ReLU must be positive");
        }

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let (network, layer_names) = match &variant {
            Variant::UNet => {
                let unet = UNetInit {
                    in_c: INPUT_CHANNELS,
                    base_c: base_channels,
                    activation,
                }
                .build(&root);
                let layer_names = unet.layer_names();
                (Network::UNet(unet), layer_names)
            }
            Variant::Residual(config) => {
                let stage = ResidualStageInit {
                    in_c: INPUT_CHANNELS,
                    config: config.clone(),
                }
                .build(&root);
                let layer_names = stage.layer_names();
                (Network::Residual(stage), layer_names)
            }
        };
        let weights = WeightRegistry::collect(&vs, &layer_names)?;

        info!(
            "built {:?} network in {:?} mode with {} weight tensors",
            variant,
            mode,
            weights.len()
        );

        let model = MaskTrajectory {
            vs,
            mode,
            variant,
            network,
            weights,
            prefetch,
            validation_steps,
            epoch: 0,
            trainer: None,
            encoder_outputs: vec![],
            decoder_outputs: vec![],
        };

        if let Some(path) = weights_file {
            model.load_weights(&path, false)?;
        }

        Ok(model)
    }
}

#[derive(Debug)]
enum Network {
    UNet(UNet),
    Residual(ResidualStage),
}

#[derive(Debug)]
struct NetworkOutput {
    output: Tensor,
    encoder: Vec<Tensor>,
    decoder: Vec<Tensor>,
}

impl Network {
    fn forward_t(&self, flow: &Tensor, prev_mask: &Tensor, train: bool) -> Result<NetworkOutput> {
        let (flow_n, flow_c, flow_h, flow_w) = flow.size4()?;
        let (mask_n, mask_c, mask_h, mask_w) = prev_mask.size4()?;
        ensure!(
            flow_c == 2 && mask_c == 1,
            "expect 2 flow channels and 1 mask channel, but get {} and {}",
            flow_c,
            mask_c
        );
        ensure!(
            (flow_n, flow_h, flow_w) == (mask_n, mask_h, mask_w),
            "flow field {:?} and mask {:?} sizes mismatch",
            flow.size(),
            prev_mask.size()
        );

        let output = match self {
            Self::UNet(unet) => {
                let input = Tensor::cat(&[flow, prev_mask], 1);
                let UNetOutput {
                    mask,
                    encoder,
                    decoder,
                } = unet.forward(&input)?;
                NetworkOutput {
                    output: mask,
                    encoder,
                    decoder,
                }
            }
            Self::Residual(stage) => {
                let input = Tensor::cat(&[prev_mask, flow], 1);
                let ResidualOutput { features, blocks } = stage.forward_t(&input, train)?;
                NetworkOutput {
                    output: features,
                    encoder: blocks,
                    decoder: vec![],
                }
            }
        };

        Ok(output)
    }

    fn stages(&self) -> Vec<StageInfo> {
        match self {
            Self::UNet(unet) => unet.stages(),
            Self::Residual(stage) => stage.stages(),
        }
    }
}

#[derive(Debug)]
struct Trainer {
    optimizer: Optimizer,
    loss: MaskLoss,
}

/// Losses of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Number of completed epochs, starting from 1.
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
}

/// The mask propagation network.
///
/// It predicts where an instance mask moves to in the next frame from the
/// mask of the previous frame and the optical flow between both frames.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MaskTrajectory {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    mode: Mode,
    variant: Variant,
    network: Network,
    weights: WeightRegistry,
    prefetch: PrefetchConfig,
    validation_steps: Option<usize>,
    epoch: usize,
    trainer: Option<Trainer>,
    #[derivative(Debug = "ignore")]
    encoder_outputs: Vec<Tensor>,
    #[derivative(Debug = "ignore")]
    decoder_outputs: Vec<Tensor>,
}

impl MaskTrajectory {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Number of completed training epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Fast-forwards the epoch counter, e.g. after restoring a checkpoint.
    ///
    /// The counter is left unchanged if it is already past `epoch`.
    pub fn resume_epoch(&mut self, epoch: usize) {
        self.epoch = self.epoch.max(epoch);
    }

    /// Encoder stages from shallow to deep, then decoder stages from deep to shallow.
    pub fn stages(&self) -> Vec<StageInfo> {
        self.network.stages()
    }

    /// Encoder stage activations of the last forward pass, shallow to deep.
    ///
    /// For the residual variant these are the block outputs.
    pub fn encoder_outputs(&self) -> &[Tensor] {
        &self.encoder_outputs
    }

    /// Decoder stage activations of the last forward pass, deep to shallow.
    pub fn decoder_outputs(&self) -> &[Tensor] {
        &self.decoder_outputs
    }

    /// Binds the optimizer and the loss used by [train_epochs](Self::train_epochs).
    pub fn compile(&mut self, optimizer: &OptimizerConfig, loss: MaskLoss) -> Result<()> {
        self.ensure_prediction_head()?;
        let optimizer = optimizer.build(&self.vs)?;
        self.trainer = Some(Trainer { optimizer, loss });
        Ok(())
    }

    /// Runs the network without touching gradients and records the stage activations.
    ///
    /// Inputs are batched `[batch, 2, height, width]` flow fields and
    /// `[batch, 1, height, width]` masks. The U-Net returns probabilities in
    /// `[batch, 1, height, width]` shape, the residual variant returns its
    /// feature map.
    pub fn forward(&mut self, flow: &Tensor, prev_mask: &Tensor) -> Result<Tensor> {
        let device = self.device();
        let flow = flow.to_device(device).to_kind(Kind::Float);
        let prev_mask = prev_mask.to_device(device).to_kind(Kind::Float);

        let NetworkOutput {
            output,
            encoder,
            decoder,
        } = tch::no_grad(|| self.network.forward_t(&flow, &prev_mask, false))?;
        self.encoder_outputs = encoder;
        self.decoder_outputs = decoder;

        Ok(output)
    }

    /// Predicts the mask in the current frame.
    ///
    /// Accepts a single `[2, height, width]` flow with a `[1, height, width]`
    /// mask, or batches of both. The output has the rank of the input.
    pub fn infer(&mut self, flow: &Tensor, prev_mask: &Tensor) -> Result<Tensor> {
        self.ensure_mode(Mode::Inference)?;
        self.ensure_prediction_head()?;

        match (flow.dim(), prev_mask.dim()) {
            (3, 3) => {
                let mask = self.forward(&flow.unsqueeze(0), &prev_mask.unsqueeze(0))?;
                Ok(mask.squeeze_dim(0))
            }
            (4, 4) => self.forward(flow, prev_mask),
            (flow_dim, mask_dim) => bail!(
                "expect 3 or 4 dimensional inputs of equal rank, but get {} and {}",
                flow_dim,
                mask_dim
            ),
        }
    }

    /// Predicts masks for every batch of an input generator.
    pub fn infer_batches<G>(&mut self, generator: &G) -> Result<Vec<Tensor>>
    where
        G: BatchSequence<Batch = InputBatch>,
    {
        (0..generator.len())
            .map(|index| {
                let InputBatch { flow, prev_mask } = generator.get_batch(index)?;
                self.infer(&flow, &prev_mask)
            })
            .try_collect()
    }

    /// Trains from the current epoch up to `epochs`.
    ///
    /// Each epoch consumes `steps_per_epoch` training batches, or the
    /// generator length if absent, followed by a validation pass. The epoch
    /// counter never decreases: calling with `epochs` not greater than
    /// [epoch](Self::epoch) trains nothing.
    pub fn train_epochs<G, V>(
        &mut self,
        train_generator: &mut G,
        validation_generator: &mut V,
        epochs: usize,
        steps_per_epoch: Option<usize>,
    ) -> Result<Vec<EpochSummary>>
    where
        G: BatchSequence<Batch = TrainingBatch> + Sync,
        V: BatchSequence<Batch = TrainingBatch> + Sync,
    {
        self.ensure_mode(Mode::Training)?;
        self.ensure_prediction_head()?;
        ensure!(
            self.trainer.is_some(),
            "the network must be compiled before training"
        );

        let train_steps = steps_per_epoch.unwrap_or_else(|| train_generator.len());
        let validation_steps = self
            .validation_steps
            .unwrap_or_else(|| validation_generator.len());
        ensure!(train_steps > 0, "no training steps per epoch");

        let mut summaries = vec![];

        for epoch in self.epoch..epochs {
            info!("start epoch {}/{}", epoch + 1, epochs);

            let train_loss = self.train_one_epoch(train_generator, train_steps)?;
            let val_loss = if validation_steps > 0 && !validation_generator.is_empty() {
                Some(self.validate(validation_generator, validation_steps)?)
            } else {
                None
            };

            match val_loss {
                Some(val_loss) => info!(
                    "epoch {}/{}\ttrain loss {:.5}\tvalidation loss {:.5}",
                    epoch + 1,
                    epochs,
                    train_loss,
                    val_loss
                ),
                None => info!(
                    "epoch {}/{}\ttrain loss {:.5}",
                    epoch + 1,
                    epochs,
                    train_loss
                ),
            }

            self.epoch = epoch + 1;
            summaries.push(EpochSummary {
                epoch: self.epoch,
                train_loss,
                val_loss,
            });
        }

        self.epoch = self.epoch.max(epochs);
        Ok(summaries)
    }

    fn train_one_epoch<G>(&mut self, generator: &mut G, steps: usize) -> Result<f64>
    where
        G: BatchSequence<Batch = TrainingBatch> + Sync,
    {
        let Self {
            vs,
            network,
            trainer,
            prefetch,
            ..
        } = self;
        let trainer = trainer
            .as_mut()
            .ok_or_else(|| format_err!("the network must be compiled before training"))?;
        let device = vs.device();

        let mut loss_sum = 0.0;
        let mut rate_counter = RateCounter::with_second_interval();

        run_epoch(generator, steps, prefetch, |step, batch| {
            let TrainingBatch { input, target } = batch.to_device(device);
            let NetworkOutput { output, .. } =
                network.forward_t(&input.flow, &input.prev_mask, true)?;
            let loss = trainer.loss.forward(&output, &target)?;
            trainer.optimizer.backward_step(&loss);

            let loss = f64::from(&loss);
            loss_sum += loss;

            rate_counter.add(1.0);
            if let Some(rate) = rate_counter.rate() {
                info!(
                    "step {}/{}\tloss {:.5}\t{:.2} batches/s",
                    step + 1,
                    steps,
                    loss,
                    rate
                );
            }

            Ok(())
        })?;

        Ok(loss_sum / steps as f64)
    }

    fn validate<V>(&mut self, generator: &mut V, steps: usize) -> Result<f64>
    where
        V: BatchSequence<Batch = TrainingBatch> + Sync,
    {
        let Self {
            vs,
            network,
            trainer,
            prefetch,
            ..
        } = self;
        let trainer = trainer
            .as_ref()
            .ok_or_else(|| format_err!("the network must be compiled before validation"))?;
        let device = vs.device();

        let mut loss_sum = 0.0;
        run_epoch(generator, steps, prefetch, |_, batch| {
            let TrainingBatch { input, target } = batch.to_device(device);
            let loss = tch::no_grad(|| -> Result<_> {
                let NetworkOutput { output, .. } =
                    network.forward_t(&input.flow, &input.prev_mask, false)?;
                trainer.loss.forward(&output, &target)
            })?;
            loss_sum += f64::from(&loss);
            Ok(())
        })?;

        Ok(loss_sum / steps as f64)
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        self.weights.save(path)
    }

    /// Restores weights saved by [save_weights](Self::save_weights).
    ///
    /// Returns the number of restored tensors.
    pub fn load_weights(&self, path: impl AsRef<Path>, by_name: bool) -> Result<usize> {
        let path = path.as_ref();
        let count = self.weights.load(path, by_name)?;
        info!("loaded {} weight tensors from '{}'", count, path.display());
        Ok(count)
    }

    fn ensure_mode(&self, expected: Mode) -> Result<()> {
        if self.mode != expected {
            return Err(MaskTrajectoryError::Mode {
                expected,
                found: self.mode,
            }
            .into());
        }
        Ok(())
    }

    fn ensure_prediction_head(&self) -> Result<()> {
        match self.network {
            Network::UNet(_) => Ok(()),
            Network::Residual(_) => Err(MaskTrajectoryError::NoPredictionHead.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{PropagationExample, PropagationInput, SampleSource},
        generator::{InferenceBatchGenerator, SequentialBatchGenerator},
    };

    /// Random flows with the target equal to the previous mask.
    #[derive(Debug)]
    struct StillSource {
        len: usize,
        size: i64,
    }

    impl SampleSource for StillSource {
        fn num_samples(&self) -> usize {
            self.len
        }

        fn sample(&self, index: usize) -> Result<PropagationExample> {
            ensure!(index < self.len, "invalid index {}", index);
            let size = self.size;
            let mask = Tensor::rand(&[1, size, size], FLOAT_CPU)
                .ge(0.5)
                .to_kind(Kind::Float);
            Ok(PropagationExample {
                input: PropagationInput {
                    flow: Tensor::randn(&[2, size, size], FLOAT_CPU) * 0.1,
                    prev_mask: mask.copy(),
                },
                target: mask,
            })
        }
    }

    fn tiny(mode: Mode) -> MaskTrajectoryInit {
        MaskTrajectoryInit {
            base_channels: 2,
            prefetch: PrefetchConfig {
                workers: 2,
                max_queue_size: 2,
            },
            ..MaskTrajectoryInit::new(mode)
        }
    }

    #[test]
    fn epoch_counter_never_decreases() -> Result<()> {
        let mut model = tiny(Mode::Training).build(Device::Cpu)?;
        model.compile(&OptimizerConfig::default(), MaskLoss::default())?;

        let mut train = SequentialBatchGenerator::with_seed(StillSource { len: 6, size: 16 }, 2, 1)?;
        let mut validation =
            SequentialBatchGenerator::with_seed(StillSource { len: 2, size: 16 }, 2, 2)?;

        let summaries = model.train_epochs(&mut train, &mut validation, 3, None)?;
        assert_eq!(model.epoch(), 3);
        assert_eq!(
            summaries.iter().map(|summary| summary.epoch).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(summaries
            .iter()
            .all(|summary| summary.train_loss.is_finite() && summary.val_loss.is_some()));

        let summaries = model.train_epochs(&mut train, &mut validation, 2, None)?;
        assert!(summaries.is_empty());
        assert_eq!(model.epoch(), 3);

        let summaries = model.train_epochs(&mut train, &mut validation, 4, Some(5))?;
        assert_eq!(summaries.len(), 1);
        assert_eq!(model.epoch(), 4);
        Ok(())
    }

    #[test]
    fn training_requires_compilation() -> Result<()> {
        let mut model = tiny(Mode::Training).build(Device::Cpu)?;
        let mut train = SequentialBatchGenerator::new(StillSource { len: 2, size: 8 }, 2)?;
        let mut validation = SequentialBatchGenerator::new(StillSource { len: 0, size: 8 }, 2)?;
        assert!(model
            .train_epochs(&mut train, &mut validation, 1, None)
            .is_err());
        assert_eq!(model.epoch(), 0);
        Ok(())
    }

    #[test]
    fn modes_are_enforced() -> Result<()> {
        let flow = Tensor::zeros(&[2, 8, 8], FLOAT_CPU);
        let mask = Tensor::zeros(&[1, 8, 8], FLOAT_CPU);

        let mut model = tiny(Mode::Training).build(Device::Cpu)?;
        let err = model.infer(&flow, &mask).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::Mode {
                expected: Mode::Inference,
                found: Mode::Training,
            })
        ));

        let mut model = tiny(Mode::Inference).build(Device::Cpu)?;
        model.compile(&OptimizerConfig::default(), MaskLoss::L2)?;
        let mut train = SequentialBatchGenerator::new(StillSource { len: 2, size: 8 }, 2)?;
        let mut validation = SequentialBatchGenerator::new(StillSource { len: 2, size: 8 }, 2)?;
        let err = model
            .train_epochs(&mut train, &mut validation, 1, None)
            .unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::Mode {
                expected: Mode::Training,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn infer_keeps_input_rank() -> Result<()> {
        let mut model = tiny(Mode::Inference).build(Device::Cpu)?;

        let flow = Tensor::randn(&[2, 40, 24], FLOAT_CPU);
        let mask = Tensor::ones(&[1, 40, 24], FLOAT_CPU);
        let single = model.infer(&flow, &mask)?;
        assert_eq!(single.size(), vec![1, 40, 24]);
        assert_eq!(model.encoder_outputs().len(), 5);
        assert_eq!(model.decoder_outputs().len(), 4);
        assert_eq!(model.stages().len(), 9);

        let batched = model.infer(
            &flow.unsqueeze(0).repeat(&[3, 1, 1, 1]),
            &mask.unsqueeze(0).repeat(&[3, 1, 1, 1]),
        )?;
        assert_eq!(batched.size(), vec![3, 1, 40, 24]);
        assert!(bool::from((batched.get(2) - &single).abs().le(1e-5).all()));

        assert!(model
            .infer(&flow, &Tensor::ones(&[1, 40, 25], FLOAT_CPU))
            .is_err());
        assert!(model
            .infer(&Tensor::zeros(&[2, 8, 8], FLOAT_CPU), &Tensor::zeros(&[1, 8, 8], FLOAT_CPU))
            .is_err());
        assert!(model.infer(&flow.unsqueeze(0), &mask).is_err());
        Ok(())
    }

    #[test]
    fn infer_generator_batches() -> Result<()> {
        let mut model = tiny(Mode::Inference).build(Device::Cpu)?;
        let generator = InferenceBatchGenerator::new(StillSource { len: 5, size: 16 }, 2)?;

        let masks = model.infer_batches(&generator)?;
        let sizes: Vec<_> = masks.iter().map(|mask| mask.size()[0]).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn residual_variant_has_no_head() -> Result<()> {
        let mut model = MaskTrajectoryInit {
            variant: Variant::Residual(ResidualConfig {
                filters: [4, 4, 8],
                ..Default::default()
            }),
            ..MaskTrajectoryInit::new(Mode::Inference)
        }
        .build(Device::Cpu)?;

        let flow = Tensor::zeros(&[1, 2, 16, 16], FLOAT_CPU);
        let mask = Tensor::zeros(&[1, 1, 16, 16], FLOAT_CPU);

        let features = model.forward(&flow, &mask)?;
        assert_eq!(features.size(), vec![1, 8, 8, 8]);
        assert_eq!(model.encoder_outputs().len(), 3);
        assert!(model.decoder_outputs().is_empty());

        for err in [
            model.infer(&flow, &mask).unwrap_err(),
            model
                .compile(&OptimizerConfig::default(), MaskLoss::default())
                .unwrap_err(),
        ] {
            assert!(matches!(
                MaskTrajectoryError::of(&err),
                Some(MaskTrajectoryError::NoPredictionHead)
            ));
        }
        Ok(())
    }

    #[test]
    fn weights_file_is_restored_on_build() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.ot");

        let mut source = tiny(Mode::Inference).build(Device::Cpu)?;
        source.save_weights(&path)?;

        let mut restored = MaskTrajectoryInit {
            weights_file: Some(path.clone()),
            ..tiny(Mode::Inference)
        }
        .build(Device::Cpu)?;

        let flow = Tensor::randn(&[2, 16, 16], FLOAT_CPU);
        let mask = Tensor::ones(&[1, 16, 16], FLOAT_CPU);
        let expect = source.infer(&flow, &mask)?;
        let found = restored.infer(&flow, &mask)?;
        assert!(bool::from(expect.eq_tensor(&found).all()));

        let wider = MaskTrajectoryInit {
            base_channels: 4,
            ..tiny(Mode::Inference)
        }
        .build(Device::Cpu)?;
        let err = wider.load_weights(&path, true).unwrap_err();
        assert!(matches!(
            MaskTrajectoryError::of(&err),
            Some(MaskTrajectoryError::WeightShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn parse_init() {
        let init: MaskTrajectoryInit = serde_json::from_str(
            r#"{ "mode": "training", "variant": { "kind": "residual", "filters": [8, 8, 16] } }"#,
        )
        .unwrap();
        assert_eq!(init.mode, Mode::Training);
        assert_eq!(init.base_channels, 64);
        assert_eq!(init.activation, Activation::relu6());
        assert!(matches!(
            init.variant,
            Variant::Residual(ResidualConfig {
                filters: [8, 8, 16],
                stage: 5,
                ..
            })
        ));

        let init: MaskTrajectoryInit = serde_json::from_str(
            r#"{ "mode": "inference", "activation": { "bounded_relu": { "max": 1.5 } } }"#,
        )
        .unwrap();
        assert_eq!(init.variant, Variant::UNet);
        assert_eq!(init.activation, Activation::BoundedRelu { max: 1.5 });

        let init: MaskTrajectoryInit =
            serde_json::from_str(r#"{ "mode": "inference", "activation": "leaky" }"#).unwrap();
        assert_eq!(init.activation, Activation::Leaky);
    }

    #[test]
    fn reject_non_positive_relu_ceiling() {
        let init = MaskTrajectoryInit {
            activation: Activation::BoundedRelu { max: 0.0 },
            base_channels: 2,
            ..MaskTrajectoryInit::new(Mode::Inference)
        };
        assert!(init.build(Device::Cpu).is_err());
    }
}
