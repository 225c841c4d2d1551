use burn::config::Config;
use burn::module::Module;
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};

use super::activation::{Activation, ActivationConfig, ActivationKind};

#[derive(Module, Debug)]
pub struct MlpLayer<B: Backend> {
    linear: Linear<B>,
    norm: Option<BatchNorm<B, 0>>,
    activation: Activation,
    dropout: Option<Dropout>,
}

/// Stack of `linear -> [batch norm] -> activation -> [dropout]` blocks, one per
/// consecutive pair in `dims`.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<MlpLayer<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = x;
        for layer in &self.layers {
            x = layer.linear.forward(x);
            if let Some(norm) = &layer.norm {
                x = norm.forward(x);
            }
            x = layer.activation.forward(x);
            if let Some(dropout) = &layer.dropout {
                x = dropout.forward(x);
            }
        }
        x
    }
}

#[derive(Config, Debug)]
pub struct MlpConfig {
    dims: Vec<usize>,

    #[config(default = "ActivationKind::Relu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let layers = self
            .dims
            .windows(2)
            .map(|pair| MlpLayer {
                linear: LinearConfig::new(pair[0], pair[1]).init(device),
                norm: if self.batch_norm {
                    Some(BatchNormConfig::new(pair[1]).init(device))
                } else {
                    None
                },
                activation: ActivationConfig::new(self.activation).init(),
                dropout: if self.dropout > 0.0 {
                    Some(DropoutConfig::new(self.dropout).init())
                } else {
                    None
                },
            })
            .collect();

        Mlp { layers }
    }

    pub fn output_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }
}
