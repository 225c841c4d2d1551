use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use super::encoder::{Encoder, EncoderConfig};
use super::pooling::pool_net::{PoolNet, PoolNetConfig};
use crate::data::batchitem::SceneRange;
use crate::error::Error;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};
use crate::utils::time_step;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscriminatorType {
    /// Classifies each encoded trajectory on its own.
    Local,
    /// Pools encoded trajectories over their scene from the start positions.
    Global,
}

impl FromStr for DiscriminatorType {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "local" => Ok(DiscriminatorType::Local),
            "global" => Ok(DiscriminatorType::Global),
            other => Err(Error::config(format!("unknown discriminator type `{other}`"))),
        }
    }
}

impl fmt::Display for DiscriminatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscriminatorType::Local => f.write_str("local"),
            DiscriminatorType::Global => f.write_str("global"),
        }
    }
}

/// Hidden layer followed by a linear projection to one unbounded score.
#[derive(Module, Debug)]
pub struct ScoreHead<B: Backend> {
    hidden: Mlp<B>,
    output: Linear<B>,
}

impl<B: Backend> ScoreHead<B> {
    pub fn new(
        d_input: usize,
        mlp_dim: usize,
        activation: ActivationKind,
        batch_norm: bool,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            hidden: MlpConfig::new(vec![d_input, mlp_dim])
                .with_activation(activation)
                .with_batch_norm(batch_norm)
                .with_dropout(dropout)
                .init(device),
            output: LinearConfig::new(mlp_dim, 1).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.output.forward(self.hidden.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct TrajectoryDiscriminator<B: Backend> {
    encoder: Encoder<B>,
    pool_net: Option<PoolNet<B>>,
    real_classifier: ScoreHead<B>,
}

impl<B: Backend> TrajectoryDiscriminator<B> {
    /// Real/fake logits, `[N, 1]`, for full trajectories `[N, T_obs + T_pred, 2]`.
    pub fn forward(
        &self,
        traj: Tensor<B, 3>,
        traj_rel: Tensor<B, 3>,
        ranges: &[SceneRange],
    ) -> Tensor<B, 2> {
        let final_h = self.encoder.forward(traj_rel.clone());
        let classifier_input = match &self.pool_net {
            Some(pool_net) => pool_net.forward(
                final_h,
                time_step(traj, 0),
                time_step(traj_rel, 0),
                ranges,
            ),
            None => final_h,
        };
        self.real_classifier.forward(classifier_input)
    }
}

#[derive(Config, Debug)]
pub struct TrajectoryDiscriminatorConfig {
    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 16)]
    h_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 1)]
    num_layers: usize,

    #[config(default = "DiscriminatorType::Local")]
    d_type: DiscriminatorType,

    #[config(default = "ActivationKind::LeakyRelu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl TrajectoryDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TrajectoryDiscriminator<B> {
        let encoder = EncoderConfig::new()
            .with_embedding_dim(self.embedding_dim)
            .with_h_dim(self.h_dim)
            .with_num_layers(self.num_layers)
            .init(device);

        let pool_net = match self.d_type {
            DiscriminatorType::Global => Some(
                PoolNetConfig::new(self.h_dim, self.h_dim)
                    .with_embedding_dim(self.embedding_dim)
                    .with_mlp_dim(self.mlp_dim)
                    .with_activation(self.activation)
                    .with_batch_norm(self.batch_norm)
                    .with_dropout(self.dropout)
                    .init(device),
            ),
            DiscriminatorType::Local => None,
        };

        TrajectoryDiscriminator {
            encoder,
            pool_net,
            real_classifier: ScoreHead::new(
                self.h_dim,
                self.mlp_dim,
                self.activation,
                self.batch_norm,
                self.dropout,
                device,
            ),
        }
    }
}
