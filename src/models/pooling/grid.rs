use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::data::batchitem::SceneRange;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};
use crate::utils::tensor_to_vec;

/// Raw `(cell_x, cell_y)` of `other` inside the square of side
/// `neighborhood_size` centred on `origin`, top-left based.
pub fn grid_cell_coords(
    origin: [f32; 2],
    other: [f32; 2],
    neighborhood_size: f32,
    grid_size: usize,
) -> (i64, i64) {
    let half = neighborhood_size / 2.0;
    let top_left = [origin[0] - half, origin[1] + half];
    let cell_x = ((other[0] - top_left[0]) / neighborhood_size * grid_size as f32).floor();
    let cell_y = ((top_left[1] - other[1]) / neighborhood_size * grid_size as f32).floor();
    (cell_x as i64, cell_y as i64)
}

/// Flattened cell index of `other` relative to `origin`, or `None` when it lies
/// on or outside the neighbourhood border.
pub fn grid_cell(
    origin: [f32; 2],
    other: [f32; 2],
    neighborhood_size: f32,
    grid_size: usize,
) -> Option<usize> {
    let half = neighborhood_size / 2.0;
    let top_left = [origin[0] - half, origin[1] + half];
    let bottom_right = [origin[0] + half, origin[1] - half];

    if other[0] >= bottom_right[0]
        || other[0] <= top_left[0]
        || other[1] >= top_left[1]
        || other[1] <= bottom_right[1]
    {
        return None;
    }

    let (cell_x, cell_y) = grid_cell_coords(origin, other, neighborhood_size, grid_size);
    let grid = grid_size as i64;
    if (0..grid).contains(&cell_x) && (0..grid).contains(&cell_y) {
        Some((cell_x + cell_y * grid) as usize)
    } else {
        None
    }
}

/// Social LSTM style occupancy pooling: neighbours' hidden states are summed
/// into the grid cell they occupy, then the flattened grid is projected.
#[derive(Module, Debug)]
pub struct GridPooling<B: Backend> {
    mlp_pool: Mlp<B>,
    h_dim: usize,
    out_dim: usize,
    grid_size: usize,
    neighborhood_size: f32,
}

impl<B: Backend> GridPooling<B> {
    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,    // [N, h]
        positions: Tensor<B, 2>, // [N, 2]
        ranges: &[SceneRange],
    ) -> Tensor<B, 2> {
        let device = hidden.device();
        let cells = self.grid_size * self.grid_size;
        let host_positions = tensor_to_vec(positions);
        let position = |idx: usize| [host_positions[idx * 2], host_positions[idx * 2 + 1]];

        let mut pooled = Vec::with_capacity(ranges.len());
        let mut keep = Vec::new();
        for range in ranges {
            let num_peds = range.len();
            let curr_hidden = hidden.clone().slice([range.start..range.end, 0..self.h_dim]);

            // assignment[i * cells + cell, j] = 1 when j sits in cell of i's grid
            let mut assignment = vec![0.0f32; num_peds * cells * num_peds];
            for i in 0..num_peds {
                for j in 0..num_peds {
                    if i == j {
                        continue;
                    }
                    let cell = grid_cell(
                        position(range.start + i),
                        position(range.start + j),
                        self.neighborhood_size,
                        self.grid_size,
                    );
                    if let Some(cell) = cell {
                        assignment[(i * cells + cell) * num_peds + j] = 1.0;
                    }
                }
            }
            let assignment: Tensor<B, 2> = Tensor::from_data(
                TensorData::new(assignment, [num_peds * cells, num_peds]),
                &device,
            );
            let grid = assignment
                .matmul(curr_hidden)
                .reshape([num_peds, cells * self.h_dim]);
            pooled.push(grid);

            let lone = if num_peds == 1 { 0.0 } else { 1.0 };
            keep.extend(std::iter::repeat(lone).take(num_peds * self.out_dim));
        }

        let num_peds = keep.len() / self.out_dim;
        let keep: Tensor<B, 2> =
            Tensor::from_data(TensorData::new(keep, [num_peds, self.out_dim]), &device);

        self.mlp_pool.forward(Tensor::cat(pooled, 0)) * keep
    }
}

#[derive(Config, Debug)]
pub struct GridPoolingConfig {
    h_dim: usize,
    out_dim: usize,

    #[config(default = 2.0)]
    neighborhood_size: f32,

    #[config(default = 8)]
    grid_size: usize,

    #[config(default = "ActivationKind::Relu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl GridPoolingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GridPooling<B> {
        let mlp_pool = MlpConfig::new(vec![
            self.grid_size * self.grid_size * self.h_dim,
            self.out_dim,
        ])
        .with_activation(self.activation)
        .with_batch_norm(self.batch_norm)
        .with_dropout(self.dropout)
        .init(device);

        GridPooling {
            mlp_pool,
            h_dim: self.h_dim,
            out_dim: self.out_dim,
            grid_size: self.grid_size,
            neighborhood_size: self.neighborhood_size,
        }
    }
}
