use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::{Dataset, InMemDataset};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::batchitem::{SceneRange, TrajectoryBatch};
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PedestrianTrack {
    pub positions: Vec<[f32; 2]>,
    #[serde(default)]
    pub non_linear: bool,
    #[serde(default)]
    pub loss_mask: Option<Vec<f32>>,
}

/// One scene worth of co-occurring pedestrians, observation and prediction
/// windows back to back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SceneSample {
    pub scene_id: usize,
    pub pedestrians: Vec<PedestrianTrack>,
}

impl SceneSample {
    /// Keeps only tracks spanning exactly `seq_len` positions.
    pub fn retain_complete_tracks(&mut self, seq_len: usize) {
        let before = self.pedestrians.len();
        self.pedestrians
            .retain(|track| track.positions.len() == seq_len);
        if self.pedestrians.len() < before {
            warn!(
                scene = self.scene_id,
                dropped = before - self.pedestrians.len(),
                expected = seq_len,
                "dropping tracks with wrong length"
            );
        }
    }
}

/// Loads JSON-row scenes, keeping complete tracks only and skipping scenes
/// left without any, so every batch drawn from the dataset is non-empty.
pub fn load_from_file(
    filename: &str,
    obs_len: usize,
    pred_len: usize,
) -> Result<InMemDataset<SceneSample>> {
    let rows = InMemDataset::<SceneSample>::from_json_rows(filename)?;
    Ok(InMemDataset::new(complete_scenes(rows.iter(), obs_len + pred_len)))
}

pub fn complete_scenes(
    scenes: impl IntoIterator<Item = SceneSample>,
    seq_len: usize,
) -> Vec<SceneSample> {
    scenes
        .into_iter()
        .filter_map(|mut scene| {
            scene.retain_complete_tracks(seq_len);
            if scene.pedestrians.is_empty() {
                warn!(scene = scene.scene_id, "skipping scene without complete tracks");
                None
            } else {
                Some(scene)
            }
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct TrajectoryBatcher<B: Backend> {
    device: B::Device,
    obs_len: usize,
    pred_len: usize,
}

impl<B: Backend> TrajectoryBatcher<B> {
    pub fn new(device: B::Device, obs_len: usize, pred_len: usize) -> Self {
        Self {
            device,
            obs_len,
            pred_len,
        }
    }

    pub fn try_batch(&self, items: Vec<SceneSample>) -> Result<TrajectoryBatch<B>> {
        let seq_len = self.obs_len + self.pred_len;

        let mut obs = Vec::new();
        let mut pred = Vec::new();
        let mut obs_rel = Vec::new();
        let mut pred_rel = Vec::new();
        let mut non_linear = Vec::new();
        let mut loss_mask = Vec::new();
        let mut scene_ranges = Vec::new();
        let mut scene_ids = Vec::new();

        for item in items {
            let start = non_linear.len();
            for (idx, track) in item.pedestrians.iter().enumerate() {
                if track.positions.len() != seq_len {
                    warn!(
                        scene = item.scene_id,
                        pedestrian = idx,
                        len = track.positions.len(),
                        expected = seq_len,
                        "dropping track with wrong length"
                    );
                    continue;
                }

                for (t, position) in track.positions.iter().enumerate() {
                    let rel = if t == 0 {
                        [0.0, 0.0]
                    } else {
                        let prev = track.positions[t - 1];
                        [position[0] - prev[0], position[1] - prev[1]]
                    };
                    if t < self.obs_len {
                        obs.extend_from_slice(position);
                        obs_rel.extend_from_slice(&rel);
                    } else {
                        pred.extend_from_slice(position);
                        pred_rel.extend_from_slice(&rel);
                    }
                }

                non_linear.push(if track.non_linear { 1.0 } else { 0.0 });
                match &track.loss_mask {
                    Some(mask) if mask.len() == seq_len => loss_mask.extend_from_slice(mask),
                    Some(mask) => {
                        warn!(
                            scene = item.scene_id,
                            pedestrian = idx,
                            len = mask.len(),
                            "ignoring loss mask with wrong length"
                        );
                        loss_mask.extend(std::iter::repeat(1.0).take(seq_len));
                    }
                    None => loss_mask.extend(std::iter::repeat(1.0).take(seq_len)),
                }
            }

            let end = non_linear.len();
            if end == start {
                warn!(scene = item.scene_id, "dropping scene without complete tracks");
                continue;
            }
            scene_ranges.push(SceneRange::new(start, end));
            scene_ids.push(item.scene_id);
        }

        let num_peds = non_linear.len();
        if num_peds == 0 {
            return Err(Error::SceneRange(
                "batch contains no complete pedestrian track".to_string(),
            ));
        }

        TrajectoryBatch::new(
            self.tensor3(obs, [num_peds, self.obs_len, 2]),
            self.tensor3(pred, [num_peds, self.pred_len, 2]),
            self.tensor3(obs_rel, [num_peds, self.obs_len, 2]),
            self.tensor3(pred_rel, [num_peds, self.pred_len, 2]),
            Tensor::from_data(TensorData::new(non_linear, [num_peds]), &self.device),
            Tensor::from_data(TensorData::new(loss_mask, [num_peds, seq_len]), &self.device),
            scene_ranges,
            scene_ids,
        )
    }

    fn tensor3(&self, values: Vec<f32>, shape: [usize; 3]) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(values, shape), &self.device)
    }
}

/// Items must come from [`load_from_file`] or [`complete_scenes`]; a batch
/// without a single complete track cannot be represented.
impl<B: Backend> Batcher<SceneSample, TrajectoryBatch<B>> for TrajectoryBatcher<B> {
    fn batch(&self, items: Vec<SceneSample>) -> TrajectoryBatch<B> {
        match self.try_batch(items) {
            Ok(batch) => batch,
            Err(err) => panic!("failed to assemble trajectory batch: {err}"),
        }
    }
}
