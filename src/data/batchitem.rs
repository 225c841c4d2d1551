use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open `[start, end)` range of pedestrians forming one scene.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneRange {
    pub start: usize,
    pub end: usize,
}

impl SceneRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Checks that `ranges` partition `[0, total)` in order with no empty scene.
pub fn validate_scene_ranges(ranges: &[SceneRange], total: usize) -> Result<()> {
    let mut cursor = 0;
    for (idx, range) in ranges.iter().enumerate() {
        if range.start != cursor {
            return Err(Error::SceneRange(format!(
                "scene {idx} starts at {} but previous scene ended at {cursor}",
                range.start
            )));
        }
        if range.end <= range.start {
            return Err(Error::SceneRange(format!(
                "scene {idx} is empty or reversed ({}..{})",
                range.start, range.end
            )));
        }
        cursor = range.end;
    }
    if cursor != total {
        return Err(Error::SceneRange(format!(
            "scenes cover {cursor} pedestrians but the batch has {total}"
        )));
    }
    Ok(())
}

/// Maps every pedestrian to the index of the scene containing it.
pub fn pedestrian_scene_index(ranges: &[SceneRange]) -> Vec<usize> {
    ranges
        .iter()
        .enumerate()
        .flat_map(|(scene, range)| std::iter::repeat(scene).take(range.len()))
        .collect()
}

#[derive(Clone, Debug)]
pub struct TrajectoryBatch<B: Backend> {
    pub obs_traj: Tensor<B, 3>,         // [N, T_obs, 2]
    pub pred_traj_gt: Tensor<B, 3>,     // [N, T_pred, 2]
    pub obs_traj_rel: Tensor<B, 3>,     // [N, T_obs, 2]
    pub pred_traj_gt_rel: Tensor<B, 3>, // [N, T_pred, 2]
    pub non_linear_ped: Tensor<B, 1>,   // [N]
    pub loss_mask: Tensor<B, 2>,        // [N, T_obs + T_pred]
    pub scene_ranges: Vec<SceneRange>,
    pub scene_ids: Vec<usize>, // one per scene range
}

impl<B: Backend> TrajectoryBatch<B> {
    /// Builds a batch, rejecting malformed scene ranges and misaligned tensors.
    pub fn new(
        obs_traj: Tensor<B, 3>,
        pred_traj_gt: Tensor<B, 3>,
        obs_traj_rel: Tensor<B, 3>,
        pred_traj_gt_rel: Tensor<B, 3>,
        non_linear_ped: Tensor<B, 1>,
        loss_mask: Tensor<B, 2>,
        scene_ranges: Vec<SceneRange>,
        scene_ids: Vec<usize>,
    ) -> Result<Self> {
        let [num_peds, obs_len, _] = obs_traj.dims();
        let pred_len = pred_traj_gt.dims()[1];

        check_shape("obs_traj", obs_traj.dims().to_vec(), vec![num_peds, obs_len, 2])?;
        check_shape("pred_traj_gt", pred_traj_gt.dims().to_vec(), vec![num_peds, pred_len, 2])?;
        check_shape("obs_traj_rel", obs_traj_rel.dims().to_vec(), vec![num_peds, obs_len, 2])?;
        check_shape(
            "pred_traj_gt_rel",
            pred_traj_gt_rel.dims().to_vec(),
            vec![num_peds, pred_len, 2],
        )?;
        check_shape("non_linear_ped", non_linear_ped.dims().to_vec(), vec![num_peds])?;
        check_shape(
            "loss_mask",
            loss_mask.dims().to_vec(),
            vec![num_peds, obs_len + pred_len],
        )?;

        validate_scene_ranges(&scene_ranges, num_peds)?;
        if scene_ids.len() != scene_ranges.len() {
            return Err(Error::SceneRange(format!(
                "{} scene ids for {} scene ranges",
                scene_ids.len(),
                scene_ranges.len()
            )));
        }

        Ok(Self {
            obs_traj,
            pred_traj_gt,
            obs_traj_rel,
            pred_traj_gt_rel,
            non_linear_ped,
            loss_mask,
            scene_ranges,
            scene_ids,
        })
    }

    pub fn num_pedestrians(&self) -> usize {
        self.obs_traj.dims()[0]
    }

    pub fn obs_len(&self) -> usize {
        self.obs_traj.dims()[1]
    }

    pub fn pred_len(&self) -> usize {
        self.pred_traj_gt.dims()[1]
    }

    /// Loss mask restricted to the prediction window, `[N, T_pred]`.
    pub fn pred_loss_mask(&self) -> Tensor<B, 2> {
        let [n, total] = self.loss_mask.dims();
        self.loss_mask.clone().slice([0..n, self.obs_len()..total])
    }

    pub fn linear_ped(&self) -> Tensor<B, 1> {
        self.non_linear_ped.ones_like() - self.non_linear_ped.clone()
    }

    /// Full ground-truth trajectory, absolute and relative, `[N, T_obs + T_pred, 2]`.
    pub fn real_trajectory(&self) -> (Tensor<B, 3>, Tensor<B, 3>) {
        (
            Tensor::cat(vec![self.obs_traj.clone(), self.pred_traj_gt.clone()], 1),
            Tensor::cat(vec![self.obs_traj_rel.clone(), self.pred_traj_gt_rel.clone()], 1),
        )
    }
}

impl<B: AutodiffBackend> TrajectoryBatch<B> {
    /// Drops the autodiff wrapper for evaluation passes.
    pub fn inner(&self) -> TrajectoryBatch<B::InnerBackend> {
        TrajectoryBatch {
            obs_traj: self.obs_traj.clone().inner(),
            pred_traj_gt: self.pred_traj_gt.clone().inner(),
            obs_traj_rel: self.obs_traj_rel.clone().inner(),
            pred_traj_gt_rel: self.pred_traj_gt_rel.clone().inner(),
            non_linear_ped: self.non_linear_ped.clone().inner(),
            loss_mask: self.loss_mask.clone().inner(),
            scene_ranges: self.scene_ranges.clone(),
            scene_ids: self.scene_ids.clone(),
        }
    }
}

fn check_shape(what: &'static str, actual: Vec<usize>, expected: Vec<usize>) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Shape {
            what,
            expected,
            actual,
        })
    }
}
