use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{backend::Backend, Distribution, Tensor};
use burn::train::{RegressionOutput, TrainOutput, TrainStep, ValidStep};
use serde::{Deserialize, Serialize};

use super::decoder::{Decoder, DecoderConfig};
use super::encoder::{Encoder, EncoderConfig};
use super::pooling::{InteractionPooling, InteractionPoolingConfig, SocialPoolingKind, StaticPoolingKind};
use crate::data::batchitem::{pedestrian_scene_index, SceneRange, TrajectoryBatch};
use crate::error::Error;
use crate::geometry::SceneGeometryStore;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};
use crate::utils::{index_tensor, l2_loss, last_time_step, relative_to_abs, LossMode};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoiseType {
    Gaussian,
    Uniform,
}

impl FromStr for NoiseType {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "gaussian" => Ok(NoiseType::Gaussian),
            "uniform" => Ok(NoiseType::Uniform),
            other => Err(Error::config(format!("unknown noise type `{other}`"))),
        }
    }
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseType::Gaussian => f.write_str("gaussian"),
            NoiseType::Uniform => f.write_str("uniform"),
        }
    }
}

/// Whether one noise vector is shared by a whole scene or drawn per pedestrian.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMixType {
    Global,
    Ped,
}

impl FromStr for NoiseMixType {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "global" => Ok(NoiseMixType::Global),
            "ped" => Ok(NoiseMixType::Ped),
            other => Err(Error::config(format!("unknown noise mix type `{other}`"))),
        }
    }
}

impl fmt::Display for NoiseMixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseMixType::Global => f.write_str("global"),
            NoiseMixType::Ped => f.write_str("ped"),
        }
    }
}

#[derive(Module, Debug)]
pub struct TrajectoryGenerator<B: Backend> {
    encoder: Encoder<B>,
    pooling: Option<InteractionPooling<B>>,
    mlp_decoder_context: Option<Mlp<B>>,
    decoder: Decoder<B>,
    noise_type: Ignored<NoiseType>,
    noise_mix_type: Ignored<NoiseMixType>,
    noise_dim: usize,
    obs_len: usize,
    pred_len: usize,
}

impl<B: Backend> TrajectoryGenerator<B> {
    pub fn obs_len(&self) -> usize {
        self.obs_len
    }

    pub fn pred_len(&self) -> usize {
        self.pred_len
    }

    /// Shape of the noise expected for this batch layout, `None` without noise.
    pub fn noise_shape(&self, num_peds: usize, num_scenes: usize) -> Option<[usize; 2]> {
        if self.noise_dim == 0 {
            return None;
        }
        match self.noise_mix_type.0 {
            NoiseMixType::Global => Some([num_scenes, self.noise_dim]),
            NoiseMixType::Ped => Some([num_peds, self.noise_dim]),
        }
    }

    fn add_noise(
        &self,
        input: Tensor<B, 2>, // [N, decoder_h - noise_dim]
        ranges: &[SceneRange],
        user_noise: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 2> {
        let [num_peds, _] = input.dims();
        let shape = match self.noise_shape(num_peds, ranges.len()) {
            Some(shape) => shape,
            None => return input,
        };
        let device = input.device();

        let noise = user_noise.unwrap_or_else(|| match self.noise_type.0 {
            NoiseType::Gaussian => Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
            NoiseType::Uniform => Tensor::random(shape, Distribution::Uniform(-1.0, 1.0), &device),
        });

        let noise = match self.noise_mix_type.0 {
            NoiseMixType::Global => {
                let scenes = pedestrian_scene_index(ranges)
                    .into_iter()
                    .map(|scene| scene as i64)
                    .collect();
                noise.select(0, index_tensor::<B>(scenes, &device))
            }
            NoiseMixType::Ped => noise,
        };

        Tensor::cat(vec![input, noise], 1)
    }

    /// Predicts relative displacements `[N, pred_len, 2]` from an observed
    /// window with freshly sampled noise.
    pub fn forward(
        &self,
        obs_traj: Tensor<B, 3>,     // [N, T_obs, 2]
        obs_traj_rel: Tensor<B, 3>, // [N, T_obs, 2]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> Tensor<B, 3> {
        self.predict(obs_traj, obs_traj_rel, ranges, scene_ids, None)
    }

    /// Same as [`forward`](Self::forward) with caller-supplied noise, which must
    /// match [`noise_shape`](Self::noise_shape) for this batch.
    pub fn forward_with_noise(
        &self,
        obs_traj: Tensor<B, 3>,
        obs_traj_rel: Tensor<B, 3>,
        ranges: &[SceneRange],
        scene_ids: &[usize],
        noise: Tensor<B, 2>,
    ) -> crate::error::Result<Tensor<B, 3>> {
        let [num_peds, _, _] = obs_traj.dims();
        let expected = self
            .noise_shape(num_peds, ranges.len())
            .ok_or_else(|| Error::config("generator was built without noise (noise_dim = 0)"))?;
        if noise.dims() != expected {
            return Err(Error::Shape {
                what: "generator noise",
                expected: expected.to_vec(),
                actual: noise.dims().to_vec(),
            });
        }
        Ok(self.predict(obs_traj, obs_traj_rel, ranges, scene_ids, Some(noise)))
    }

    fn predict(
        &self,
        obs_traj: Tensor<B, 3>,
        obs_traj_rel: Tensor<B, 3>,
        ranges: &[SceneRange],
        scene_ids: &[usize],
        user_noise: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 3> {
        let final_encoder_h = self.encoder.forward(obs_traj_rel.clone());
        let last_pos = last_time_step(obs_traj);
        let last_pos_rel = last_time_step(obs_traj_rel);

        let pooled = self.pooling.as_ref().and_then(|pooling| {
            pooling.forward(
                final_encoder_h.clone(),
                last_pos.clone(),
                last_pos_rel.clone(),
                ranges,
                scene_ids,
            )
        });
        let context = match pooled {
            Some(pooled) => Tensor::cat(vec![final_encoder_h, pooled], 1),
            None => final_encoder_h,
        };

        let noise_input = match &self.mlp_decoder_context {
            Some(mlp) => mlp.forward(context),
            None => context,
        };
        let decoder_h = self.add_noise(noise_input, ranges, user_noise);

        let (pred_traj_rel, _) =
            self.decoder
                .forward(last_pos, last_pos_rel, decoder_h, ranges, scene_ids);
        pred_traj_rel
    }

    /// Single-sample L2 regression on the prediction window.
    pub fn forward_regression(&self, batch: TrajectoryBatch<B>) -> RegressionOutput<B> {
        let loss_mask = batch.pred_loss_mask();
        let start = last_time_step(batch.obs_traj.clone());
        let pred_rel = self.forward(
            batch.obs_traj,
            batch.obs_traj_rel,
            &batch.scene_ranges,
            &batch.scene_ids,
        );
        let loss = l2_loss(
            pred_rel.clone(),
            batch.pred_traj_gt_rel,
            loss_mask,
            LossMode::Average,
        );

        let pred = relative_to_abs(pred_rel, start);
        let [num_peds, pred_len, _] = pred.dims();
        let output = pred.reshape([num_peds, pred_len * 2]);
        let targets = batch.pred_traj_gt.reshape([num_peds, pred_len * 2]);

        RegressionOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<TrajectoryBatch<B>, RegressionOutput<B>> for TrajectoryGenerator<B> {
    fn step(&self, batch: TrajectoryBatch<B>) -> TrainOutput<RegressionOutput<B>> {
        let item = self.forward_regression(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<TrajectoryBatch<B>, RegressionOutput<B>> for TrajectoryGenerator<B> {
    fn step(&self, batch: TrajectoryBatch<B>) -> RegressionOutput<B> {
        self.forward_regression(batch)
    }
}

#[derive(Config, Debug)]
pub struct TrajectoryGeneratorConfig {
    obs_len: usize,
    pred_len: usize,

    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 32)]
    encoder_h_dim: usize,

    #[config(default = 32)]
    decoder_h_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 1)]
    num_layers: usize,

    /// Zero disables noise.
    #[config(default = 8)]
    noise_dim: usize,

    #[config(default = "NoiseType::Gaussian")]
    noise_type: NoiseType,

    #[config(default = "NoiseMixType::Global")]
    noise_mix_type: NoiseMixType,

    #[config(default = "SocialPoolingKind::PoolNet")]
    social_pooling: SocialPoolingKind,

    #[config(default = "StaticPoolingKind::None")]
    static_pooling: StaticPoolingKind,

    #[config(default = false)]
    pool_every_timestep: bool,

    #[config(default = 8)]
    bottleneck_dim: usize,

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

    #[config(default = "ActivationKind::LeakyRelu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl TrajectoryGeneratorConfig {
    /// Pooling settings shared by the context pooling and the decoder.
    pub fn pooling_config(&self, h_dim: usize) -> InteractionPoolingConfig {
        InteractionPoolingConfig::new(h_dim)
            .with_social(self.social_pooling)
            .with_static_kind(self.static_pooling)
            .with_bottleneck_dim(self.bottleneck_dim)
            .with_embedding_dim(self.embedding_dim)
            .with_mlp_dim(self.mlp_dim)
            .with_neighborhood_size(self.neighborhood_size)
            .with_grid_size(self.grid_size)
            .with_num_cells(self.num_cells)
            .with_down_samples(self.down_samples)
            .with_pooling_dim(self.pooling_dim)
            .with_activation(self.activation)
            .with_batch_norm(self.batch_norm)
            .with_dropout(self.dropout)
    }

    pub fn init<B: Backend>(
        &self,
        geometry: Option<Arc<SceneGeometryStore>>,
        device: &B::Device,
    ) -> crate::error::Result<TrajectoryGenerator<B>> {
        if self.obs_len == 0 || self.pred_len == 0 {
            return Err(Error::config("obs_len and pred_len must be at least 1"));
        }
        if self.noise_dim >= self.decoder_h_dim {
            return Err(Error::config(format!(
                "noise_dim {} must be smaller than decoder_h_dim {}",
                self.noise_dim, self.decoder_h_dim
            )));
        }

        let encoder = EncoderConfig::new()
            .with_embedding_dim(self.embedding_dim)
            .with_h_dim(self.encoder_h_dim)
            .with_num_layers(self.num_layers)
            .init(device);

        let pooling = self
            .pooling_config(self.encoder_h_dim)
            .init(geometry.clone(), device)?;
        let pooling = Some(pooling).filter(|pooling: &InteractionPooling<B>| pooling.is_enabled());
        let input_dim = self.encoder_h_dim + pooling.as_ref().map_or(0, |p| p.output_dim());

        let mlp_decoder_needed = self.noise_dim > 0
            || pooling.is_some()
            || self.encoder_h_dim != self.decoder_h_dim;
        let mlp_decoder_context = mlp_decoder_needed.then(|| {
            MlpConfig::new(vec![
                input_dim,
                self.mlp_dim,
                self.decoder_h_dim - self.noise_dim,
            ])
            .with_activation(self.activation)
            .with_batch_norm(self.batch_norm)
            .with_dropout(self.dropout)
            .init(device)
        });

        let decoder_pooling = self
            .pool_every_timestep
            .then(|| self.pooling_config(self.decoder_h_dim));
        let decoder = DecoderConfig::new(self.pred_len)
            .with_embedding_dim(self.embedding_dim)
            .with_h_dim(self.decoder_h_dim)
            .with_mlp_dim(self.mlp_dim)
            .with_num_layers(self.num_layers)
            .with_pooling(decoder_pooling)
            .with_activation(self.activation)
            .with_batch_norm(self.batch_norm)
            .with_dropout(self.dropout)
            .init(geometry, device)?;

        Ok(TrajectoryGenerator {
            encoder,
            pooling,
            mlp_decoder_context,
            decoder,
            noise_type: Ignored(self.noise_type),
            noise_mix_type: Ignored(self.noise_mix_type),
            noise_dim: self.noise_dim,
            obs_len: self.obs_len,
            pred_len: self.pred_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tensor_to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn observed(device: &<TestBackend as Backend>::Device) -> (Tensor<TestBackend, 3>, Tensor<TestBackend, 3>) {
        let obs = Tensor::<TestBackend, 3>::random([3, 4, 2], Distribution::Default, device);
        let rel = Tensor::<TestBackend, 3>::random([3, 4, 2], Distribution::Default, device);
        (obs, rel)
    }

    #[test]
    fn test_parse_noise_options() {
        assert_eq!("uniform".parse::<NoiseType>().unwrap(), NoiseType::Uniform);
        assert_eq!("ped".parse::<NoiseMixType>().unwrap(), NoiseMixType::Ped);
        assert!(matches!("pink".parse::<NoiseType>(), Err(Error::Config(_))));
        assert!(matches!("scene".parse::<NoiseMixType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_prediction_shape_with_pooling_every_step() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(4, 5)
            .with_pool_every_timestep(true)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let (obs, rel) = observed(&device);
        let ranges = [SceneRange::new(0, 2), SceneRange::new(2, 3)];

        let pred = generator.forward(obs, rel, &ranges, &[0, 1]);
        assert_eq!(pred.dims(), [3, 5, 2]);
        assert!(tensor_to_vec(pred).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_user_noise_makes_prediction_deterministic() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(4, 3)
            .with_batch_norm(false)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let (obs, rel) = observed(&device);
        let ranges = [SceneRange::new(0, 3)];
        assert_eq!(generator.noise_shape(3, 1), Some([1, 8]));

        let noise = Tensor::<TestBackend, 2>::ones([1, 8], &device);
        let a = generator
            .forward_with_noise(obs.clone(), rel.clone(), &ranges, &[0], noise.clone())
            .unwrap();
        let b = generator
            .forward_with_noise(obs, rel, &ranges, &[0], noise)
            .unwrap();
        assert_eq!(tensor_to_vec(a), tensor_to_vec(b));
    }

    #[test]
    fn test_rejects_noise_of_wrong_shape() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(4, 3)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let (obs, rel) = observed(&device);
        let ranges = [SceneRange::new(0, 2), SceneRange::new(2, 3)];

        // global noise is drawn per scene, not per pedestrian
        let per_ped = Tensor::<TestBackend, 2>::ones([3, 8], &device);
        let result = generator.forward_with_noise(obs.clone(), rel.clone(), &ranges, &[0, 1], per_ped);
        assert!(matches!(result, Err(Error::Shape { .. })));

        let narrow = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        let result = generator.forward_with_noise(obs.clone(), rel.clone(), &ranges, &[0, 1], narrow);
        assert!(matches!(result, Err(Error::Shape { .. })));

        let per_scene = Tensor::<TestBackend, 2>::ones([2, 8], &device);
        assert!(generator
            .forward_with_noise(obs, rel, &ranges, &[0, 1], per_scene)
            .is_ok());
    }

    #[test]
    fn test_without_noise_or_pooling_context_mlp_is_skipped() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(4, 3)
            .with_noise_dim(0)
            .with_social_pooling(SocialPoolingKind::None)
            .init::<TestBackend>(None, &device)
            .unwrap();
        assert!(generator.mlp_decoder_context.is_none());
        assert!(generator.pooling.is_none());
        assert_eq!(generator.noise_shape(3, 1), None);
    }

    #[test]
    fn test_rejects_noise_wider_than_decoder() {
        let device = Default::default();
        let result = TrajectoryGeneratorConfig::new(4, 3)
            .with_noise_dim(32)
            .init::<TestBackend>(None, &device);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_regression_output() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(4, 3)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let batch = TrajectoryBatch::new(
            Tensor::zeros([2, 4, 2], &device),
            Tensor::ones([2, 3, 2], &device),
            Tensor::zeros([2, 4, 2], &device),
            Tensor::zeros([2, 3, 2], &device),
            Tensor::zeros([2], &device),
            Tensor::ones([2, 7], &device),
            vec![SceneRange::new(0, 2)],
            vec![0],
        )
        .unwrap();

        let output = generator.forward_regression(batch);
        assert_eq!(output.output.dims(), [2, 6]);
        assert_eq!(output.targets.dims(), [2, 6]);
        assert!(tensor_to_vec(output.loss).iter().all(|v| v.is_finite()));
    }
}
