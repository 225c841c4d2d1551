use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig};
use burn::tensor::{backend::Backend, Tensor};

use crate::utils::last_time_step;

/// Embeds relative displacements and runs them through stacked LSTM layers,
/// starting from a zero state on every call.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    spatial_embedding: Linear<B>,
    layers: Vec<Lstm<B>>,
    h_dim: usize,
}

impl<B: Backend> Encoder<B> {
    /// Top layer output for every step, `[N, T, h]`.
    pub fn forward_sequence(&self, traj_rel: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut x = self.spatial_embedding.forward(traj_rel);
        for lstm in &self.layers {
            let (output, _) = lstm.forward(x, None);
            x = output;
        }
        x
    }

    /// Final hidden state of the top layer, `[N, h]`.
    pub fn forward(&self, traj_rel: Tensor<B, 3>) -> Tensor<B, 2> {
        last_time_step(self.forward_sequence(traj_rel))
    }

    pub fn h_dim(&self) -> usize {
        self.h_dim
    }
}

#[derive(Config, Debug)]
pub struct EncoderConfig {
    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 32)]
    h_dim: usize,

    #[config(default = 1)]
    num_layers: usize,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let layers = (0..self.num_layers.max(1))
            .map(|layer| {
                let d_input = if layer == 0 { self.embedding_dim } else { self.h_dim };
                LstmConfig::new(d_input, self.h_dim, true).init(device)
            })
            .collect();

        Encoder {
            spatial_embedding: LinearConfig::new(2, self.embedding_dim).init(device),
            layers,
            h_dim: self.h_dim,
        }
    }
}
