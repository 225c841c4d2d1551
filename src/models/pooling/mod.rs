pub mod attention;
pub mod beams;
pub mod grid;
pub mod pool_net;
pub mod static_pool;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::data::batchitem::SceneRange;
use crate::error::Error;
use crate::geometry::SceneGeometryStore;
use crate::modules::activation::ActivationKind;

use attention::{PhysicalAttention, PhysicalAttentionConfig};
use grid::{GridPooling, GridPoolingConfig};
use pool_net::{PoolNet, PoolNetConfig};
use static_pool::{StaticPooling, StaticPoolingConfig};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SocialPoolingKind {
    None,
    SocialPooling,
    PoolNet,
}

impl FromStr for SocialPoolingKind {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "none" => Ok(SocialPoolingKind::None),
            "social_pooling" | "spool" => Ok(SocialPoolingKind::SocialPooling),
            "pool_net" => Ok(SocialPoolingKind::PoolNet),
            other => Err(Error::config(format!("unknown social pooling type `{other}`"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaticPoolingKind {
    None,
    Random,
    RandomCnn,
    RandomCnnAtrous,
    Polar,
    PolarTruePoints,
    Raycast,
    RaycastTruePoints,
    PhysicalAttention,
}

impl FromStr for StaticPoolingKind {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "none" => Ok(StaticPoolingKind::None),
            "random" => Ok(StaticPoolingKind::Random),
            "random_cnn" => Ok(StaticPoolingKind::RandomCnn),
            "random_cnn_atrous" => Ok(StaticPoolingKind::RandomCnnAtrous),
            "polar" => Ok(StaticPoolingKind::Polar),
            "polar_true_points" => Ok(StaticPoolingKind::PolarTruePoints),
            "raycast" => Ok(StaticPoolingKind::Raycast),
            "raycast_true_points" => Ok(StaticPoolingKind::RaycastTruePoints),
            "physical_attention" => Ok(StaticPoolingKind::PhysicalAttention),
            other => Err(Error::config(format!("unknown static pooling type `{other}`"))),
        }
    }
}

impl fmt::Display for StaticPoolingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StaticPoolingKind::None => "none",
            StaticPoolingKind::Random => "random",
            StaticPoolingKind::RandomCnn => "random_cnn",
            StaticPoolingKind::RandomCnnAtrous => "random_cnn_atrous",
            StaticPoolingKind::Polar => "polar",
            StaticPoolingKind::PolarTruePoints => "polar_true_points",
            StaticPoolingKind::Raycast => "raycast",
            StaticPoolingKind::RaycastTruePoints => "raycast_true_points",
            StaticPoolingKind::PhysicalAttention => "physical_attention",
        };
        f.write_str(name)
    }
}

/// Social and static pooling blocks selected once at construction. Outputs are
/// concatenated social first.
#[derive(Module, Debug)]
pub struct InteractionPooling<B: Backend> {
    grid: Option<GridPooling<B>>,
    pool_net: Option<PoolNet<B>>,
    physical: Option<StaticPooling<B>>,
    attention: Option<PhysicalAttention<B>>,
    output_dim: usize,
}

impl<B: Backend> InteractionPooling<B> {
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn is_enabled(&self) -> bool {
        self.output_dim > 0
    }

    /// `None` when no pooling block is configured.
    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,        // [N, h]
        positions: Tensor<B, 2>,     // [N, 2]
        displacements: Tensor<B, 2>, // [N, 2]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> Option<Tensor<B, 2>> {
        let mut outputs = Vec::with_capacity(2);

        if let Some(grid) = &self.grid {
            outputs.push(grid.forward(hidden.clone(), positions.clone(), ranges));
        }
        if let Some(pool_net) = &self.pool_net {
            outputs.push(pool_net.forward(
                hidden.clone(),
                positions.clone(),
                displacements.clone(),
                ranges,
            ));
        }
        if let Some(physical) = &self.physical {
            outputs.push(physical.forward(
                hidden.clone(),
                positions.clone(),
                displacements.clone(),
                ranges,
                scene_ids,
            ));
        }
        if let Some(attention) = &self.attention {
            outputs.push(attention.forward(hidden, positions, displacements, ranges, scene_ids));
        }

        match outputs.len() {
            0 => None,
            1 => outputs.pop(),
            _ => Some(Tensor::cat(outputs, 1)),
        }
    }
}

#[derive(Config, Debug)]
pub struct InteractionPoolingConfig {
    h_dim: usize,

    #[config(default = "SocialPoolingKind::PoolNet")]
    social: SocialPoolingKind,

    #[config(default = "StaticPoolingKind::None")]
    static_kind: StaticPoolingKind,

    #[config(default = 8)]
    bottleneck_dim: usize,

    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 2.0)]
    neighborhood_size: f32,

    #[config(default = 8)]
    grid_size: usize,

    #[config(default = 15)]
    num_cells: usize,

    #[config(default = 200)]
    down_samples: usize,

    #[config(default = 2)]
    pooling_dim: usize,

    #[config(default = true)]
    bounded: bool,

    #[config(default = 5)]
    feature_channels: usize,

    #[config(default = "ActivationKind::LeakyRelu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl InteractionPoolingConfig {
    pub fn has_social(&self) -> bool {
        self.social != SocialPoolingKind::None
    }

    pub fn has_static(&self) -> bool {
        self.static_kind != StaticPoolingKind::None
    }

    /// Widths of the social and static blocks.
    pub fn block_dims(&self) -> (usize, usize) {
        match (self.has_social(), self.has_static()) {
            (true, true) => {
                let social = self.bottleneck_dim / 2;
                (social, self.bottleneck_dim - social)
            }
            (true, false) => (self.bottleneck_dim, 0),
            (false, true) => (0, self.bottleneck_dim),
            (false, false) => (0, 0),
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if !(self.neighborhood_size.is_finite() && self.neighborhood_size > 0.0) {
            return Err(Error::config(format!(
                "neighborhood_size must be positive, got {}",
                self.neighborhood_size
            )));
        }
        if self.grid_size == 0 || self.num_cells == 0 || self.down_samples == 0 {
            return Err(Error::config(
                "grid_size, num_cells and down_samples must be at least 1",
            ));
        }
        if self.pooling_dim != 2 && self.pooling_dim != 4 {
            return Err(Error::config(format!(
                "pooling_dim must be 2 or 4, got {}",
                self.pooling_dim
            )));
        }
        let cnn = matches!(
            self.static_kind,
            StaticPoolingKind::RandomCnn | StaticPoolingKind::RandomCnnAtrous
        );
        if cnn && (self.embedding_dim == 0 || self.down_samples < self.embedding_dim) {
            return Err(Error::config(format!(
                "static pooling `{}` needs down_samples >= embedding_dim >= 1, got {} and {}",
                self.static_kind, self.down_samples, self.embedding_dim
            )));
        }
        let (social, physical) = self.block_dims();
        if (self.has_social() && social == 0) || (self.has_static() && physical == 0) {
            return Err(Error::config(format!(
                "bottleneck_dim {} is too small for the enabled pooling blocks",
                self.bottleneck_dim
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(
        &self,
        geometry: Option<Arc<SceneGeometryStore>>,
        device: &B::Device,
    ) -> crate::error::Result<InteractionPooling<B>> {
        self.validate()?;
        let (social_dim, static_dim) = self.block_dims();

        let grid = match self.social {
            SocialPoolingKind::SocialPooling => Some(
                GridPoolingConfig::new(self.h_dim, social_dim)
                    .with_neighborhood_size(self.neighborhood_size)
                    .with_grid_size(self.grid_size)
                    .with_activation(self.activation)
                    .with_batch_norm(self.batch_norm)
                    .with_dropout(self.dropout)
                    .init(device),
            ),
            _ => None,
        };

        let pool_net = match self.social {
            SocialPoolingKind::PoolNet => Some(
                PoolNetConfig::new(self.h_dim, social_dim)
                    .with_embedding_dim(self.embedding_dim)
                    .with_mlp_dim(self.mlp_dim)
                    .with_pooling_dim(self.pooling_dim)
                    .with_neighborhood_size(self.neighborhood_size)
                    .with_bounded(self.bounded)
                    .with_activation(self.activation)
                    .with_batch_norm(self.batch_norm)
                    .with_dropout(self.dropout)
                    .init(device),
            ),
            _ => None,
        };

        let store = match (self.has_static(), geometry) {
            (false, _) => None,
            (true, Some(store)) => Some(store),
            (true, None) => {
                return Err(Error::config(format!(
                    "static pooling `{}` requires scene geometry",
                    self.static_kind
                )))
            }
        };

        let (physical, attention) = match (self.static_kind, store) {
            (StaticPoolingKind::PhysicalAttention, Some(store)) => {
                check_feature_channels(&store, self.feature_channels)?;
                let attention = PhysicalAttentionConfig::new(self.h_dim, static_dim)
                    .with_feature_channels(self.feature_channels)
                    .init(store, device);
                (None, Some(attention))
            }
            (kind, Some(store)) => {
                let physical = StaticPoolingConfig::new(self.h_dim, static_dim, kind)
                    .with_embedding_dim(self.embedding_dim)
                    .with_mlp_dim(self.mlp_dim)
                    .with_num_cells(self.num_cells)
                    .with_down_samples(self.down_samples)
                    .with_neighborhood_size(self.neighborhood_size)
                    .with_activation(self.activation)
                    .with_batch_norm(self.batch_norm)
                    .with_dropout(self.dropout)
                    .init(store, device);
                (Some(physical), None)
            }
            (_, None) => (None, None),
        };

        Ok(InteractionPooling {
            grid,
            pool_net,
            physical,
            attention,
            output_dim: social_dim + static_dim,
        })
    }
}

fn check_feature_channels(store: &SceneGeometryStore, channels: usize) -> crate::error::Result<()> {
    for idx in 0..store.len() {
        if let Some(grid) = store.features(idx) {
            if !grid.is_empty() && grid.channels != channels {
                return Err(Error::config(format!(
                    "scene `{}` has {} feature channels, expected {channels}",
                    store.name(idx).unwrap_or_default(),
                    grid.channels
                )));
            }
        }
    }
    Ok(())
}
