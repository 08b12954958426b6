use crate::common::*;

/// The optimization rule and its hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        lr: R64,
        #[serde(default = "default_beta1")]
        beta1: R64,
        #[serde(default = "default_beta2")]
        beta2: R64,
        #[serde(default = "default_weight_decay")]
        weight_decay: R64,
    },
    Sgd {
        lr: R64,
        #[serde(default)]
        momentum: R64,
        #[serde(default = "default_weight_decay")]
        weight_decay: R64,
        #[serde(default)]
        nesterov: bool,
    },
    RmsProp {
        lr: R64,
        #[serde(default = "default_alpha")]
        alpha: R64,
        #[serde(default)]
        momentum: R64,
        #[serde(default = "default_weight_decay")]
        weight_decay: R64,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: r64(1e-4),
            beta1: default_beta1(),
            beta2: default_beta2(),
            weight_decay: default_weight_decay(),
        }
    }
}

fn default_beta1() -> R64 {
    r64(0.9)
}

fn default_beta2() -> R64 {
    r64(0.999)
}

fn default_alpha() -> R64 {
    r64(0.99)
}

fn default_weight_decay() -> R64 {
    r64(0.0)
}

impl OptimizerConfig {
    pub fn lr(&self) -> f64 {
        match *self {
            Self::Adam { lr, .. } | Self::Sgd { lr, .. } | Self::RmsProp { lr, .. } => lr.raw(),
        }
    }

    pub fn build(&self, vs: &nn::VarStore) -> Result<Optimizer> {
        let optimizer = match *self {
            Self::Adam {
                lr,
                beta1,
                beta2,
                weight_decay,
            } => Optimizer::Adam(
                nn::Adam {
                    beta1: beta1.raw(),
                    beta2: beta2.raw(),
                    wd: weight_decay.raw(),
                    ..Default::default()
                }
                .build(vs, lr.raw())?,
            ),
            Self::Sgd {
                lr,
                momentum,
                weight_decay,
                nesterov,
            } => Optimizer::Sgd(
                nn::Sgd {
                    momentum: momentum.raw(),
                    wd: weight_decay.raw(),
                    nesterov,
                    ..Default::default()
                }
                .build(vs, lr.raw())?,
            ),
            Self::RmsProp {
                lr,
                alpha,
                momentum,
                weight_decay,
            } => Optimizer::RmsProp(
                nn::RmsProp {
                    alpha: alpha.raw(),
                    momentum: momentum.raw(),
                    wd: weight_decay.raw(),
                    ..Default::default()
                }
                .build(vs, lr.raw())?,
            ),
        };
        Ok(optimizer)
    }
}

/// An optimizer bound to the variables of a network.
pub enum Optimizer {
    Adam(nn::Optimizer),
    Sgd(nn::Optimizer),
    RmsProp(nn::Optimizer),
}

impl Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Adam(_) => "Adam",
            Self::Sgd(_) => "Sgd",
            Self::RmsProp(_) => "RmsProp",
        };
        f.debug_tuple("Optimizer").field(&kind).finish()
    }
}

impl Optimizer {
    pub fn backward_step(&mut self, loss: &Tensor) {
        match self {
            Self::Adam(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
            Self::RmsProp(opt) => opt.backward_step(loss),
        }
    }
}
