use std::sync::Arc;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};

use super::discriminator::ScoreHead;
use super::encoder::{Encoder, EncoderConfig};
use super::pooling::{InteractionPooling, InteractionPoolingConfig, SocialPoolingKind, StaticPoolingKind};
use crate::data::batchitem::SceneRange;

use crate::geometry::SceneGeometryStore;
use crate::modules::activation::ActivationKind;
use crate::utils::last_time_step;

/// Scores full trajectories for physical plausibility. The collision head
/// regresses onto pedestrian collision counts, the occupancy head onto
/// boundary occupancy counts.
#[derive(Module, Debug)]
pub struct TrajectoryCritic<B: Backend> {
    encoder: Encoder<B>,
    pooling: Option<InteractionPooling<B>>,
    collision_classifier: ScoreHead<B>,
    occupancy_classifier: ScoreHead<B>,
}

impl<B: Backend> TrajectoryCritic<B> {
    /// Returns `(collision, occupancy)` scores, each `[N, 1]`.
    pub fn forward(
        &self,
        traj: Tensor<B, 3>,     // [N, T, 2]
        traj_rel: Tensor<B, 3>, // [N, T, 2]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let final_h = self.encoder.forward(traj_rel.clone());

        let pooled = self.pooling.as_ref().and_then(|pooling| {
            pooling.forward(
                final_h.clone(),
                last_time_step(traj),
                last_time_step(traj_rel),
                ranges,
                scene_ids,
            )
        });
        let features = match pooled {
            Some(pooled) => Tensor::cat(vec![final_h, pooled], 1),
            None => final_h,
        };

        (
            self.collision_classifier.forward(features.clone()),
            self.occupancy_classifier.forward(features),
        )
    }
}

#[derive(Config, Debug)]
pub struct TrajectoryCriticConfig {
    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 16)]
    h_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 1)]
    num_layers: usize,

    #[config(default = "SocialPoolingKind::None")]
    social_pooling: SocialPoolingKind,

    #[config(default = "StaticPoolingKind::None")]
    static_pooling: StaticPoolingKind,

    #[config(default = 8)]
    bottleneck_dim: usize,

    #[config(default = 2.0)]
    neighborhood_size: f32,

    #[config(default = 15)]
    num_cells: usize,

    #[config(default = 200)]
    down_samples: usize,

    #[config(default = "ActivationKind::LeakyRelu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl TrajectoryCriticConfig {
    pub fn init<B: Backend>(
        &self,
        geometry: Option<Arc<SceneGeometryStore>>,
        device: &B::Device,
    ) -> crate::error::Result<TrajectoryCritic<B>> {
        let encoder = EncoderConfig::new()
            .with_embedding_dim(self.embedding_dim)
            .with_h_dim(self.h_dim)
            .with_num_layers(self.num_layers)
            .init(device);

        let pooling = InteractionPoolingConfig::new(self.h_dim)
            .with_social(self.social_pooling)
            .with_static_kind(self.static_pooling)
            .with_bottleneck_dim(self.bottleneck_dim)
            .with_embedding_dim(self.embedding_dim)
            .with_mlp_dim(self.mlp_dim)
            .with_neighborhood_size(self.neighborhood_size)
            .with_num_cells(self.num_cells)
            .with_down_samples(self.down_samples)
            .with_activation(self.activation)
            .with_batch_norm(self.batch_norm)
            .with_dropout(self.dropout)
            .init(geometry, device)?;
        let pooling = Some(pooling).filter(|pooling: &InteractionPooling<B>| pooling.is_enabled());
        let d_input = self.h_dim + pooling.as_ref().map_or(0, |p| p.output_dim());

        let head = || {
            ScoreHead::new(
                d_input,
                self.mlp_dim,
                self.activation,
                self.batch_norm,
                self.dropout,
                device,
            )
        };

        Ok(TrajectoryCritic {
            encoder,
            pooling,
            collision_classifier: head(),
            occupancy_classifier: head(),
        })
    }
}
