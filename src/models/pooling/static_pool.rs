use std::sync::Arc;

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::leaky_relu;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use tracing::warn;

use super::beams::{cyclic_sample, heading, polar_beam_points, raycast_points};
use super::StaticPoolingKind;
use crate::data::batchitem::SceneRange;
use crate::geometry::SceneGeometryStore;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};
use crate::utils::{repeat_rows, tensor_to_vec, tile_rows};

/// Pools static scene boundaries around every pedestrian: a fixed number of
/// boundary offsets is embedded and mixed with the pedestrian's hidden state.
/// The `random_cnn` kinds embed the sampled offsets with a strided or dilated
/// convolution over the `[samples, 2]` image instead of a linear layer.
#[derive(Module, Debug)]
pub struct StaticPooling<B: Backend> {
    spatial_embedding: Option<Linear<B>>,
    boundary_cnn: Option<Conv2d<B>>,
    mlp_pre_pool: Mlp<B>,
    kind: Ignored<StaticPoolingKind>,
    geometry: Ignored<Arc<SceneGeometryStore>>,
    h_dim: usize,
    out_dim: usize,
    embedding_dim: usize,
    num_points: usize,
    neighborhood_size: f32,
}

impl<B: Backend> StaticPooling<B> {
    /// `[P, num_points * 2]` normalised offsets to `[P, embedding_dim]`.
    fn embed(&self, rel: Tensor<B, 2>) -> Tensor<B, 2> {
        if let Some(linear) = &self.spatial_embedding {
            return linear.forward(rel);
        }
        let num_peds = rel.dims()[0];
        let image = rel.reshape([num_peds, 1, self.num_points, 2]);
        let features = match &self.boundary_cnn {
            Some(conv) => leaky_relu(conv.forward(image), 0.01),
            None => image,
        };
        let [_, _, height, width] = features.dims();
        features
            .reshape([num_peds, height * width])
            .slice([0..num_peds, 0..self.embedding_dim])
    }

    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,        // [N, h]
        positions: Tensor<B, 2>,     // [N, 2]
        displacements: Tensor<B, 2>, // [N, 2]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> Tensor<B, 2> {
        let device = hidden.device();
        let host_positions = tensor_to_vec(positions.clone());
        let host_displacements = tensor_to_vec(displacements);
        let pair = |values: &[f32], idx: usize| [values[idx * 2], values[idx * 2 + 1]];

        let pooled: Vec<Tensor<B, 2>> = ranges
            .iter()
            .zip(scene_ids)
            .map(|(range, scene_id)| {
                let num_peds = range.len();
                if num_peds == 1 {
                    return Tensor::zeros([1, self.out_dim], &device);
                }
                if self.geometry.0.get(*scene_id).is_none() {
                    warn!(scene = scene_id, "no geometry for scene, static pooling is zero");
                }
                let boundary = self.geometry.0.boundary(*scene_id);
                if boundary.is_empty() {
                    return Tensor::zeros([num_peds, self.out_dim], &device);
                }

                let rel = match self.kind.0 {
                    StaticPoolingKind::Random
                    | StaticPoolingKind::RandomCnn
                    | StaticPoolingKind::RandomCnnAtrous => {
                        let sample: Vec<f32> = cyclic_sample(boundary, self.num_points)
                            .into_iter()
                            .flatten()
                            .collect();
                        let sample: Tensor<B, 2> = Tensor::from_data(
                            TensorData::new(sample, [self.num_points, 2]),
                            &device,
                        );
                        let curr_pos = positions.clone().slice([range.start..range.end, 0..2]);
                        let rel = tile_rows(sample, num_peds) - repeat_rows(curr_pos, self.num_points);

                        rel.clamp(-self.neighborhood_size, self.neighborhood_size)
                            .reshape([num_peds, self.num_points * 2])
                    }
                    kind => {
                        let offsets: Vec<f32> = range
                            .indices()
                            .flat_map(|idx| {
                                let position = pair(&host_positions, idx);
                                match kind {
                                    StaticPoolingKind::Polar | StaticPoolingKind::PolarTruePoints => {
                                        polar_beam_points(
                                            position,
                                            heading(pair(&host_displacements, idx)),
                                            boundary,
                                            self.num_points,
                                            self.neighborhood_size,
                                            kind == StaticPoolingKind::PolarTruePoints,
                                        )
                                    }
                                    _ => raycast_points(
                                        position,
                                        boundary,
                                        self.num_points,
                                        self.neighborhood_size,
                                        kind == StaticPoolingKind::RaycastTruePoints,
                                    ),
                                }
                            })
                            .flatten()
                            .collect();

                        Tensor::from_data(
                            TensorData::new(offsets, [num_peds, self.num_points * 2]),
                            &device,
                        )
                    }
                };

                let rel = rel / self.neighborhood_size;
                let curr_hidden = hidden.clone().slice([range.start..range.end, 0..self.h_dim]);
                let embedding = self.embed(rel);
                self.mlp_pre_pool
                    .forward(Tensor::cat(vec![embedding, curr_hidden], 1))
            })
            .collect();

        Tensor::cat(pooled, 0)
    }
}

#[derive(Config, Debug)]
pub struct StaticPoolingConfig {
    h_dim: usize,
    out_dim: usize,
    kind: StaticPoolingKind,

    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 15)]
    num_cells: usize,

    #[config(default = 200)]
    down_samples: usize,

    #[config(default = 2.0)]
    neighborhood_size: f32,

    #[config(default = "ActivationKind::Relu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl StaticPoolingConfig {
    pub fn init<B: Backend>(
        &self,
        geometry: Arc<SceneGeometryStore>,
        device: &B::Device,
    ) -> StaticPooling<B> {
        let num_points = match self.kind {
            StaticPoolingKind::Random
            | StaticPoolingKind::RandomCnn
            | StaticPoolingKind::RandomCnnAtrous => self.down_samples,
            _ => self.num_cells,
        };
        // kernel rows chosen so the output has at least `embedding_dim` rows
        let rows = (self.down_samples / self.embedding_dim.max(1)).max(1);
        let boundary_cnn = match self.kind {
            StaticPoolingKind::RandomCnn => Some(
                Conv2dConfig::new([1, 1], [rows, 2])
                    .with_stride([rows, 1])
                    .init(device),
            ),
            StaticPoolingKind::RandomCnnAtrous => Some(
                Conv2dConfig::new([1, 1], [rows, 2])
                    .with_dilation([self.embedding_dim, 1])
                    .init(device),
            ),
            _ => None,
        };
        let spatial_embedding = boundary_cnn
            .is_none()
            .then(|| LinearConfig::new(num_points * 2, self.embedding_dim).init(device));
        let mlp_pre_pool = MlpConfig::new(vec![
            self.embedding_dim + self.h_dim,
            self.mlp_dim * 8,
            self.out_dim,
        ])
        .with_activation(self.activation)
        .with_batch_norm(self.batch_norm)
        .with_dropout(self.dropout)
        .init(device);

        StaticPooling {
            spatial_embedding,
            boundary_cnn,
            mlp_pre_pool,
            kind: Ignored(self.kind),
            geometry: Ignored(geometry),
            h_dim: self.h_dim,
            out_dim: self.out_dim,
            embedding_dim: self.embedding_dim,
            num_points,
            neighborhood_size: self.neighborhood_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SceneGeometry;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn store() -> Arc<SceneGeometryStore> {
        let square: Vec<[f32; 2]> = (0..8)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::FRAC_PI_4;
                [angle.cos(), angle.sin()]
            })
            .collect();
        Arc::new(SceneGeometryStore::new(vec![
            ("a_ring".to_string(), SceneGeometry::points(square)),
            ("b_empty".to_string(), SceneGeometry::default()),
        ]))
    }

    fn run(kind: StaticPoolingKind, scene_ids: &[usize]) -> Vec<f32> {
        let device = Default::default();
        let pooling = StaticPoolingConfig::new(4, 3, kind)
            .with_num_cells(6)
            .with_down_samples(5)
            .init::<TestBackend>(store(), &device);
        let hidden = Tensor::<TestBackend, 2>::random([5, 4], Distribution::Default, &device);
        let positions = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Uniform(-0.5, 0.5), &device);
        let displacements = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Default, &device);
        let ranges = [SceneRange::new(0, 2), SceneRange::new(2, 4), SceneRange::new(4, 5)];
        tensor_to_vec(pooling.forward(hidden, positions, displacements, &ranges, scene_ids))
    }

    #[test]
    fn test_every_variant_yields_fixed_width() {
        for kind in [
            StaticPoolingKind::Random,
            StaticPoolingKind::Polar,
            StaticPoolingKind::PolarTruePoints,
            StaticPoolingKind::Raycast,
            StaticPoolingKind::RaycastTruePoints,
        ] {
            let out = run(kind, &[0, 0, 0]);
            assert_eq!(out.len(), 15);
            assert!(out.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_boundary_cnn_embeds_to_fixed_width() {
        let device = Default::default();
        for kind in [StaticPoolingKind::RandomCnn, StaticPoolingKind::RandomCnnAtrous] {
            let pooling = StaticPoolingConfig::new(4, 3, kind)
                .with_embedding_dim(4)
                .with_down_samples(20)
                .init::<TestBackend>(store(), &device);
            assert!(pooling.spatial_embedding.is_none());

            let rel = Tensor::<TestBackend, 2>::random([3, 40], Distribution::Default, &device);
            assert_eq!(pooling.embed(rel).dims(), [3, 4]);

            let hidden = Tensor::<TestBackend, 2>::random([3, 4], Distribution::Default, &device);
            let positions = Tensor::<TestBackend, 2>::zeros([3, 2], &device);
            let out = pooling.forward(
                hidden,
                positions.clone(),
                positions,
                &[SceneRange::new(0, 3)],
                &[0],
            );
            assert_eq!(out.dims(), [3, 3]);
            assert!(tensor_to_vec(out).iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_empty_geometry_and_lone_pedestrian_are_zero() {
        // scene 1 has no boundary, scene 9 does not exist
        let out = run(StaticPoolingKind::Polar, &[0, 1, 9]);
        assert!(out[6..15].iter().all(|v| *v == 0.0));
    }
}
