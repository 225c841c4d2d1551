use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};

use crate::data::batchitem::SceneRange;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};
use crate::utils::{repeat_rows, tile_rows};

/// Pairwise pooling: every (pedestrian, neighbour) relative position is embedded
/// with the neighbour's hidden state and max-pooled over neighbours.
#[derive(Module, Debug)]
pub struct PoolNet<B: Backend> {
    spatial_embedding: Linear<B>,
    mlp_pre_pool: Mlp<B>,
    h_dim: usize,
    out_dim: usize,
    pooling_dim: usize,
    neighborhood_size: f32,
    bounded: bool,
}

impl<B: Backend> PoolNet<B> {
    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,        // [N, h]
        positions: Tensor<B, 2>,     // [N, 2]
        displacements: Tensor<B, 2>, // [N, 2]
        ranges: &[SceneRange],
    ) -> Tensor<B, 2> {
        let device = hidden.device();
        let pooled: Vec<Tensor<B, 2>> = ranges
            .iter()
            .map(|range| {
                let num_peds = range.len();
                if num_peds == 1 {
                    return Tensor::zeros([1, self.out_dim], &device);
                }
                let curr_hidden = hidden.clone().slice([range.start..range.end, 0..self.h_dim]);
                let curr_pos = positions.clone().slice([range.start..range.end, 0..2]);

                // row i * n + j holds P_j - P_i
                let mut rel = tile_rows(curr_pos.clone(), num_peds) - repeat_rows(curr_pos, num_peds);
                if self.bounded {
                    let half = self.neighborhood_size / 2.0;
                    rel = rel.clamp(-half, half) / half;
                }
                if self.pooling_dim == 4 {
                    let curr_disp = displacements.clone().slice([range.start..range.end, 0..2]);
                    let rel_disp =
                        tile_rows(curr_disp.clone(), num_peds) - repeat_rows(curr_disp, num_peds);
                    rel = Tensor::cat(vec![rel, rel_disp], 1);
                }

                let embedding = self.spatial_embedding.forward(rel);
                let mlp_input = Tensor::cat(vec![embedding, tile_rows(curr_hidden, num_peds)], 1);
                let pairs = self.mlp_pre_pool.forward(mlp_input);

                pairs
                    .reshape([num_peds, num_peds, self.out_dim])
                    .max_dim(1)
                    .squeeze(1)
            })
            .collect();

        Tensor::cat(pooled, 0)
    }
}

#[derive(Config, Debug)]
pub struct PoolNetConfig {
    h_dim: usize,
    out_dim: usize,

    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 2)]
    pooling_dim: usize,

    #[config(default = 2.0)]
    neighborhood_size: f32,

    #[config(default = true)]
    bounded: bool,

    #[config(default = "ActivationKind::Relu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl PoolNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PoolNet<B> {
        let mlp_pre_pool = MlpConfig::new(vec![
            self.embedding_dim + self.h_dim,
            self.mlp_dim * 8,
            self.out_dim,
        ])
        .with_activation(self.activation)
        .with_batch_norm(self.batch_norm)
        .with_dropout(self.dropout)
        .init(device);

        PoolNet {
            spatial_embedding: LinearConfig::new(self.pooling_dim, self.embedding_dim).init(device),
            mlp_pre_pool,
            h_dim: self.h_dim,
            out_dim: self.out_dim,
            pooling_dim: self.pooling_dim,
            neighborhood_size: self.neighborhood_size,
            bounded: self.bounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{index_tensor, tensor_to_vec};
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray;

    #[test]
    fn test_output_is_invariant_to_neighbour_order() {
        let device = Default::default();
        let pool = PoolNetConfig::new(6, 5)
            .with_pooling_dim(4)
            .init::<TestBackend>(&device);

        let hidden = Tensor::<TestBackend, 2>::random([4, 6], Distribution::Default, &device);
        let positions = Tensor::<TestBackend, 2>::random([4, 2], Distribution::Uniform(-1.5, 1.5), &device);
        let displacements = Tensor::<TestBackend, 2>::random([4, 2], Distribution::Default, &device);
        let ranges = [SceneRange::new(0, 4)];

        let out = tensor_to_vec(pool.forward(hidden.clone(), positions.clone(), displacements.clone(), &ranges));

        // keep pedestrian 0 first and shuffle the others
        let order = index_tensor::<TestBackend>(vec![0, 3, 1, 2], &device);
        let shuffled = tensor_to_vec(pool.forward(
            hidden.select(0, order.clone()),
            positions.select(0, order.clone()),
            displacements.select(0, order),
            &ranges,
        ));

        for c in 0..5 {
            assert!((out[c] - shuffled[c]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_lone_pedestrian_gets_zeros() {
        let device = Default::default();
        let pool = PoolNetConfig::new(3, 2).init::<TestBackend>(&device);
        let hidden = Tensor::<TestBackend, 2>::ones([3, 3], &device);
        let positions = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 1.0, 1.0, 4.0, 4.0], [3, 2]),
            &device,
        );
        let ranges = [SceneRange::new(0, 2), SceneRange::new(2, 3)];
        let out = tensor_to_vec(pool.forward(hidden, positions.clone(), positions, &ranges));
        assert_eq!(out.len(), 6);
        assert_eq!(&out[4..], &[0.0, 0.0]);
    }
}
