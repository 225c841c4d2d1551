//! Collision and occupancy counts, used as critic labels and as evaluation
//! metrics. Counting happens on the host over `[N, T, 2]` position buffers.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::data::batchitem::SceneRange;
use crate::geometry::SceneGeometryStore;
use crate::utils::tensor_to_vec;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceNorm {
    #[default]
    L1,
    L2,
}

impl DistanceNorm {
    pub fn distance(&self, a: [f32; 2], b: [f32; 2]) -> f32 {
        let dx = a[0] - b[0];
        let dy = a[1] - b[1];
        match self {
            DistanceNorm::L1 => dx.abs() + dy.abs(),
            DistanceNorm::L2 => (dx * dx + dy * dy).sqrt(),
        }
    }
}

/// Host copy of a `[N, T, 2]` trajectory tensor.
#[derive(Debug, Clone)]
pub struct Trajectories {
    values: Vec<f32>,
    num_peds: usize,
    steps: usize,
}

impl Trajectories {
    pub fn new(values: Vec<f32>, num_peds: usize, steps: usize) -> Self {
        debug_assert_eq!(values.len(), num_peds * steps * 2);
        Self {
            values,
            num_peds,
            steps,
        }
    }

    pub fn from_tensor<B: Backend>(traj: Tensor<B, 3>) -> Self {
        let [num_peds, steps, _] = traj.dims();
        Self::new(tensor_to_vec(traj), num_peds, steps)
    }

    pub fn num_peds(&self) -> usize {
        self.num_peds
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn position(&self, ped: usize, step: usize) -> [f32; 2] {
        let offset = (ped * self.steps + step) * 2;
        [self.values[offset], self.values[offset + 1]]
    }
}

/// Whether `i` and `j` are closer than `threshold` at `step`. A pedestrian
/// never collides with itself.
pub fn collides(
    traj: &Trajectories,
    i: usize,
    j: usize,
    step: usize,
    threshold: f32,
    norm: DistanceNorm,
) -> bool {
    if i == j {
        return false;
    }
    norm.distance(traj.position(i, step), traj.position(j, step)) < threshold
}

/// Per-pedestrian collision count, summed over time and over the other
/// pedestrians of the same scene.
pub fn collision_counts(
    traj: &Trajectories,
    ranges: &[SceneRange],
    threshold: f32,
    norm: DistanceNorm,
) -> Vec<f32> {
    let mut counts = vec![0.0; traj.num_peds()];
    for range in ranges {
        for i in range.indices() {
            for j in range.indices() {
                counts[i] += (0..traj.steps())
                    .filter(|&step| collides(traj, i, j, step, threshold, norm))
                    .count() as f32;
            }
        }
    }
    counts
}

/// Per-pedestrian count of time steps spent within `threshold` of the scene
/// boundary. Scenes without boundary points count nothing.
pub fn occupancy_counts(
    traj: &Trajectories,
    ranges: &[SceneRange],
    scene_ids: &[usize],
    geometry: &SceneGeometryStore,
    threshold: f32,
    norm: DistanceNorm,
) -> Vec<f32> {
    let mut counts = vec![0.0; traj.num_peds()];
    for (range, scene_id) in ranges.iter().zip(scene_ids) {
        let boundary = geometry.boundary(*scene_id);
        if boundary.is_empty() {
            continue;
        }
        for ped in range.indices() {
            counts[ped] = (0..traj.steps())
                .filter(|&step| {
                    let position = traj.position(ped, step);
                    boundary
                        .iter()
                        .any(|point| norm.distance(position, *point) < threshold)
                })
                .count() as f32;
        }
    }
    counts
}

fn to_column<B: Backend>(counts: Vec<f32>, device: &B::Device) -> Tensor<B, 2> {
    let len = counts.len();
    Tensor::from_data(TensorData::new(counts, [len, 1]), device)
}

/// Collision counts as critic labels, `[N, 1]`.
pub fn collision_labels<B: Backend>(
    traj: Tensor<B, 3>,
    ranges: &[SceneRange],
    threshold: f32,
    norm: DistanceNorm,
) -> Tensor<B, 2> {
    let device = traj.device();
    let traj = Trajectories::from_tensor(traj);
    to_column(collision_counts(&traj, ranges, threshold, norm), &device)
}

/// Occupancy counts as critic labels, `[N, 1]`.
pub fn occupancy_labels<B: Backend>(
    traj: Tensor<B, 3>,
    ranges: &[SceneRange],
    scene_ids: &[usize],
    geometry: &SceneGeometryStore,
    threshold: f32,
    norm: DistanceNorm,
) -> Tensor<B, 2> {
    let device = traj.device();
    let traj = Trajectories::from_tensor(traj);
    to_column(
        occupancy_counts(&traj, ranges, scene_ids, geometry, threshold, norm),
        &device,
    )
}
