use super::*;
use crate::{common::*, utils::resize_like};

/// Number of encoder stages. The decoder has one stage less.
pub const NUM_ENCODER_STAGES: usize = 5;

#[derive(Debug, Clone)]
pub struct UNetInit {
    /// Channels of the concatenated input.
    pub in_c: usize,
    /// Channels of the first encoder stage. Deeper stages double it.
    pub base_c: usize,
    /// Activation after each convolution.
    pub activation: Activation,
}

impl UNetInit {
    pub fn new(in_c: usize) -> Self {
        Self {
            in_c,
            base_c: 64,
            activation: Activation::relu6(),
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> UNet {
        let path = path.borrow();
        let Self {
            in_c,
            base_c,
            activation,
        } = self;
        let in_c = in_c as i64;
        let base_c = base_c as i64;

        let channels: Vec<i64> = (0..NUM_ENCODER_STAGES)
            .map(|index| base_c << index)
            .collect();

        let encoder: Vec<_> = channels
            .iter()
            .enumerate()
            .map(|(index, &out_c)| {
                let name = format!("L{}", index + 1);
                let stage_in_c = if index == 0 { in_c } else { channels[index - 1] };
                EncoderStage {
                    pool: index > 0,
                    conv1: conv2d_same(path / format!("{}_conv1", name), stage_in_c, out_c, 3),
                    conv2: conv2d_same(path / format!("{}_conv2", name), out_c, out_c, 3),
                    out_c,
                    name,
                }
            })
            .collect();

        // P4 is fed by L5 and skips from L4, down to P1 fed by P2 and skipping from L1
        let decoder: Vec<_> = (1..NUM_ENCODER_STAGES)
            .rev()
            .map(|level| {
                let name = format!("P{}", level);
                let deep_c = channels[level];
                let out_c = channels[level - 1];
                DecoderStage {
                    upconv: nn::conv_transpose2d(
                        path / format!("{}_upconv", name),
                        deep_c,
                        deep_c,
                        2,
                        nn::ConvTransposeConfig {
                            stride: 2,
                            ..Default::default()
                        },
                    ),
                    conv1: conv2d_same(path / format!("{}_conv1", name), deep_c + out_c, out_c, 3),
                    conv2: conv2d_same(path / format!("{}_conv2", name), out_c, out_c, 3),
                    out_c,
                    name,
                }
            })
            .collect();

        let head = conv2d_same(path / "P0_conv", base_c, 1, 1);

        UNet {
            encoder,
            decoder,
            head,
            activation,
        }
    }
}

#[derive(Debug)]
struct EncoderStage {
    name: String,
    pool: bool,
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    out_c: i64,
}

#[derive(Debug)]
struct DecoderStage {
    name: String,
    upconv: nn::ConvTranspose2D,
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    out_c: i64,
}

/// The U-Net mask predictor.
#[derive(Debug)]
pub struct UNet {
    encoder: Vec<EncoderStage>,
    decoder: Vec<DecoderStage>,
    head: nn::Conv2D,
    activation: Activation,
}

/// The prediction together with the stage activations it was computed from.
#[derive(Debug)]
pub struct UNetOutput {
    /// Probabilities in `[batch, 1, height, width]` shape.
    pub mask: Tensor,
    /// Encoder outputs from the shallowest to the deepest stage.
    pub encoder: Vec<Tensor>,
    /// Decoder outputs from the deepest to the shallowest stage.
    pub decoder: Vec<Tensor>,
}

impl UNet {
    pub fn forward(&self, input: &Tensor) -> Result<UNetOutput> {
        let Self {
            encoder,
            decoder,
            head,
            activation,
        } = self;
        let act = *activation;
        let (_, _, in_h, in_w) = input.size4()?;
        let min_size = 1 << (encoder.len() - 1);
        ensure!(
            in_h >= min_size && in_w >= min_size,
            "input size {}x{} is smaller than {}x{}",
            in_h,
            in_w,
            min_size,
            min_size
        );

        let mut encoder_outputs = Vec::with_capacity(encoder.len());
        let mut xs = input.shallow_clone();
        for stage in encoder {
            if stage.pool {
                xs = xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false);
            }
            xs = xs
                .apply(&stage.conv1)
                .activation(act)
                .apply(&stage.conv2)
                .activation(act);
            encoder_outputs.push(xs.shallow_clone());
        }

        let mut decoder_outputs = Vec::with_capacity(decoder.len());
        for (stage, skip) in decoder.iter().zip(encoder_outputs.iter().rev().skip(1)) {
            let up = xs.apply(&stage.upconv);
            let skip = resize_like(skip, &up)?;
            xs = Tensor::cat(&[up, skip], 1)
                .apply(&stage.conv1)
                .activation(act)
                .apply(&stage.conv2)
                .activation(act);
            decoder_outputs.push(xs.shallow_clone());
        }

        let mask = xs
            .upsample_bilinear2d(&[in_h, in_w], false, None, None)
            .apply(head)
            .sigmoid();

        Ok(UNetOutput {
            mask,
            encoder: encoder_outputs,
            decoder: decoder_outputs,
        })
    }

    /// Encoder stages followed by decoder stages.
    pub fn stages(&self) -> Vec<StageInfo> {
        let encoder = self
            .encoder
            .iter()
            .map(|stage| StageInfo::new(stage.name.as_str(), stage.out_c));
        let decoder = self
            .decoder
            .iter()
            .map(|stage| StageInfo::new(stage.name.as_str(), stage.out_c));
        encoder.chain(decoder).collect()
    }

    /// Layer names in the order the layers are applied.
    pub fn layer_names(&self) -> Vec<String> {
        let encoder = self.encoder.iter().flat_map(|stage| {
            ["conv1", "conv2"].map(|layer| format!("{}_{}", stage.name, layer))
        });
        let decoder = self.decoder.iter().flat_map(|stage| {
            ["upconv", "conv1", "conv2"].map(|layer| format!("{}_{}", stage.name, layer))
        });
        encoder
            .chain(decoder)
            .chain(iter::once("P0_conv".to_string()))
            .collect()
    }
}
