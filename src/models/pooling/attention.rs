use std::sync::Arc;

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use tracing::warn;

use crate::data::batchitem::SceneRange;
use crate::geometry::SceneGeometryStore;
use crate::utils::{repeat_rows, tile_rows};

/// Soft attention over a scene's segmentation feature grid, queried by each
/// pedestrian's hidden state and an embedding of its position and displacement.
#[derive(Module, Debug)]
pub struct PhysicalAttention<B: Backend> {
    encoder_att: Linear<B>,
    decoder_att: Linear<B>,
    state_embedding: Linear<B>,
    full_att: Linear<B>,
    output: Linear<B>,
    geometry: Ignored<Arc<SceneGeometryStore>>,
    h_dim: usize,
    out_dim: usize,
    feature_channels: usize,
}

impl<B: Backend> PhysicalAttention<B> {
    /// Returns the pooled context and the attention weights per scene.
    pub fn forward_with_weights(
        &self,
        hidden: Tensor<B, 2>,        // [N, h]
        positions: Tensor<B, 2>,     // [N, 2]
        displacements: Tensor<B, 2>, // [N, 2]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> (Tensor<B, 2>, Vec<Option<Tensor<B, 2>>>) {
        let device = hidden.device();
        let mut pooled = Vec::with_capacity(ranges.len());
        let mut weights = Vec::with_capacity(ranges.len());

        for (range, scene_id) in ranges.iter().zip(scene_ids) {
            let num_peds = range.len();
            let grid = match self.geometry.0.features(*scene_id) {
                Some(grid) if !grid.is_empty() && num_peds > 1 => grid,
                None if num_peds > 1 => {
                    warn!(scene = scene_id, "no feature grid for scene, attention pooling is zero");
                    pooled.push(Tensor::zeros([num_peds, self.out_dim], &device));
                    weights.push(None);
                    continue;
                }
                _ => {
                    pooled.push(Tensor::zeros([num_peds, self.out_dim], &device));
                    weights.push(None);
                    continue;
                }
            };

            let cells = grid.cells;
            let features: Tensor<B, 2> = Tensor::from_data(
                TensorData::new(grid.values.clone(), [cells, self.feature_channels]),
                &device,
            );
            let curr_hidden = hidden.clone().slice([range.start..range.end, 0..self.h_dim]);
            let curr_state = Tensor::cat(
                vec![
                    positions.clone().slice([range.start..range.end, 0..2]),
                    displacements.clone().slice([range.start..range.end, 0..2]),
                ],
                1,
            );
            let query = Tensor::cat(vec![curr_hidden, self.state_embedding.forward(curr_state)], 1);

            let att_features = self.encoder_att.forward(features.clone()); // [P, A]
            let att_query = self.decoder_att.forward(query); // [n, A]

            // row i * P + p pairs pedestrian i with cell p
            let scores = self.full_att.forward(relu(
                tile_rows(att_features, num_peds) + repeat_rows(att_query, cells),
            ));
            let alpha = softmax(scores.reshape([num_peds, cells]), 1);
            let context = alpha.clone().matmul(features); // [n, C]

            pooled.push(self.output.forward(context));
            weights.push(Some(alpha));
        }

        (Tensor::cat(pooled, 0), weights)
    }

    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,
        positions: Tensor<B, 2>,
        displacements: Tensor<B, 2>,
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> Tensor<B, 2> {
        self.forward_with_weights(hidden, positions, displacements, ranges, scene_ids)
            .0
    }
}

#[derive(Config, Debug)]
pub struct PhysicalAttentionConfig {
    h_dim: usize,
    out_dim: usize,

    #[config(default = 5)]
    feature_channels: usize,

    #[config(default = 4)]
    embed_dim: usize,

    /// Width of the additive attention space; `None` uses `out_dim`.
    attention_dim: Option<usize>,
}

impl PhysicalAttentionConfig {
    pub fn init<B: Backend>(
        &self,
        geometry: Arc<SceneGeometryStore>,
        device: &B::Device,
    ) -> PhysicalAttention<B> {
        let attention_dim = self.attention_dim.unwrap_or(self.out_dim);

        PhysicalAttention {
            encoder_att: LinearConfig::new(self.feature_channels, attention_dim).init(device),
            decoder_att: LinearConfig::new(self.h_dim + self.embed_dim, attention_dim).init(device),
            state_embedding: LinearConfig::new(4, self.embed_dim).init(device),
            full_att: LinearConfig::new(attention_dim, 1).init(device),
            output: LinearConfig::new(self.feature_channels, self.out_dim).init(device),
            geometry: Ignored(geometry),
            h_dim: self.h_dim,
            out_dim: self.out_dim,
            feature_channels: self.feature_channels,
        }
    }
}
