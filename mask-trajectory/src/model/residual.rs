use super::*;
use crate::common::*;

/// Settings of the residual stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualConfig {
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Channels of the three convolutions in each block.
    #[serde(default = "default_filters")]
    pub filters: [usize; 3],
    /// Stage number used in layer names.
    #[serde(default = "default_stage")]
    pub stage: usize,
    /// Stride of the down-sampling block.
    #[serde(default = "default_stride")]
    pub stride: usize,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            kernel_size: default_kernel_size(),
            filters: default_filters(),
            stage: default_stage(),
            stride: default_stride(),
        }
    }
}

fn default_kernel_size() -> usize {
    3
}

fn default_filters() -> [usize; 3] {
    [512, 512, 2048]
}

fn default_stage() -> usize {
    5
}

fn default_stride() -> usize {
    2
}

#[derive(Debug, Clone)]
pub struct ResidualStageInit {
    pub in_c: usize,
    pub config: ResidualConfig,
}

impl ResidualStageInit {
    /// Builds one down-sampling block followed by two identity blocks.
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> ResidualStage {
        let path = path.borrow();
        let Self { in_c, config } = self;
        let ResidualConfig {
            kernel_size,
            filters,
            stage,
            stride,
        } = config;
        let [out_c1, out_c2, out_c3] = filters.map(|c| c as i64);

        let blocks: Vec<_> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let down_sample = index == 0;
                let block_in_c = if down_sample { in_c as i64 } else { out_c3 };
                let block_stride = if down_sample { stride as i64 } else { 1 };
                let conv_name = format!("res{}{}_branch", stage, block);
                let bn_name = format!("bn{}{}_branch", stage, block);

                let shortcut = down_sample.then(|| ConvBn {
                    conv: pointwise_conv(
                        path / format!("{}1", conv_name),
                        block_in_c,
                        out_c3,
                        block_stride,
                    ),
                    bn: nn::batch_norm2d(path / format!("{}1", bn_name), out_c3, Default::default()),
                });

                ResidualBlock {
                    name: format!("{}{}", stage, block),
                    branch_2a: ConvBn {
                        conv: pointwise_conv(
                            path / format!("{}2a", conv_name),
                            block_in_c,
                            out_c1,
                            block_stride,
                        ),
                        bn: nn::batch_norm2d(
                            path / format!("{}2a", bn_name),
                            out_c1,
                            Default::default(),
                        ),
                    },
                    branch_2b: ConvBn {
                        conv: conv2d_same(
                            path / format!("{}2b", conv_name),
                            out_c1,
                            out_c2,
                            kernel_size as i64,
                        ),
                        bn: nn::batch_norm2d(
                            path / format!("{}2b", bn_name),
                            out_c2,
                            Default::default(),
                        ),
                    },
                    branch_2c: ConvBn {
                        conv: pointwise_conv(path / format!("{}2c", conv_name), out_c2, out_c3, 1),
                        bn: nn::batch_norm2d(
                            path / format!("{}2c", bn_name),
                            out_c3,
                            Default::default(),
                        ),
                    },
                    shortcut,
                }
            })
            .collect();

        ResidualStage {
            blocks,
            out_c: out_c3,
        }
    }
}

fn pointwise_conv<'p>(
    path: impl Borrow<nn::Path<'p>>,
    in_c: i64,
    out_c: i64,
    stride: i64,
) -> nn::Conv2D {
    nn::conv2d(
        path,
        in_c,
        out_c,
        1,
        nn::ConvConfig {
            stride,
            ..Default::default()
        },
    )
}

#[derive(Debug)]
struct ConvBn {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv).apply_t(&self.bn, train)
    }
}

#[derive(Debug)]
struct ResidualBlock {
    name: String,
    branch_2a: ConvBn,
    branch_2b: ConvBn,
    branch_2c: ConvBn,
    /// Projection of the input, present on the down-sampling block only.
    shortcut: Option<ConvBn>,
}

impl ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            branch_2a,
            branch_2b,
            branch_2c,
            shortcut,
            ..
        } = self;

        let residual = branch_2a.forward_t(xs, train).relu();
        let residual = branch_2b.forward_t(&residual, train).relu();
        let residual = branch_2c.forward_t(&residual, train);
        let shortcut = match shortcut {
            Some(shortcut) => shortcut.forward_t(xs, train),
            None => xs.shallow_clone(),
        };

        (residual + shortcut).relu()
    }

    fn layer_names(&self) -> Vec<String> {
        let mut branches = vec!["2a", "2b", "2c"];
        if self.shortcut.is_some() {
            branches.push("1");
        }
        branches
            .into_iter()
            .flat_map(|branch| {
                [
                    format!("res{}_branch{}", self.name, branch),
                    format!("bn{}_branch{}", self.name, branch),
                ]
            })
            .collect()
    }
}

/// A stage of residual blocks producing a feature map for a detector.
#[derive(Debug)]
pub struct ResidualStage {
    blocks: Vec<ResidualBlock>,
    out_c: i64,
}

/// The stage output together with each block output.
#[derive(Debug)]
pub struct ResidualOutput {
    pub features: Tensor,
    pub blocks: Vec<Tensor>,
}

impl ResidualStage {
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<ResidualOutput> {
        let _ = input.size4()?;

        let mut xs = input.shallow_clone();
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            xs = block.forward_t(&xs, train);
            blocks.push(xs.shallow_clone());
        }

        Ok(ResidualOutput {
            features: xs,
            blocks,
        })
    }

    pub fn out_c(&self) -> i64 {
        self.out_c
    }

    pub fn stages(&self) -> Vec<StageInfo> {
        self.blocks
            .iter()
            .map(|block| StageInfo::new(format!("res{}", block.name), self.out_c))
            .collect()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|block| block.layer_names())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_stage_down_samples_once() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let stage = ResidualStageInit {
            in_c: 3,
            config: ResidualConfig {
                filters: [4, 4, 8],
                ..Default::default()
            },
        }
        .build(&vs.root());

        let input = Tensor::randn(&[2, 3, 16, 16], FLOAT_CPU);
        let output = stage.forward_t(&input, false)?;
        assert_eq!(output.features.size(), vec![2, 8, 8, 8]);
        assert!(output
            .blocks
            .iter()
            .all(|block| block.size() == vec![2, 8, 8, 8]));

        let names: Vec<_> = stage.stages().into_iter().map(|info| info.name).collect();
        assert_eq!(names, ["res5a", "res5b", "res5c"]);
        assert_eq!(stage.layer_names().len(), 8 + 6 + 6);
        assert!(vs.variables().contains_key("res5a_branch1.weight"));
        assert!(vs.variables().contains_key("bn5c_branch2c.running_var"));
        Ok(())
    }

    #[test]
    fn default_config() {
        let config: ResidualConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ResidualConfig::default());
        assert_eq!(config.filters, [512, 512, 2048]);
    }
}
