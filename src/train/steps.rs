use std::collections::BTreeMap;

use burn::tensor::{backend::Backend, Tensor};

use super::config::TrainingConfig;
use crate::data::batchitem::TrajectoryBatch;
use crate::geometry::SceneGeometryStore;
use crate::models::critic::TrajectoryCritic;
use crate::models::discriminator::TrajectoryDiscriminator;
use crate::models::generator::TrajectoryGenerator;
use crate::scoring::{collision_labels, occupancy_labels};
use crate::utils::{
    best_of_k_loss, critic_loss, gan_d_loss, gan_g_loss, l2_loss, last_time_step,
    relative_to_abs, to_scalar, LossMode,
};

pub type StepLosses = BTreeMap<String, f32>;

/// A generated prediction joined to its observed window.
pub struct FakeTrajectory<B: Backend> {
    pub pred_rel: Tensor<B, 3>, // [N, T_pred, 2]
    pub pred: Tensor<B, 3>,     // [N, T_pred, 2]
    pub traj: Tensor<B, 3>,     // [N, T_obs + T_pred, 2]
    pub traj_rel: Tensor<B, 3>, // [N, T_obs + T_pred, 2]
}

pub fn sample_fake<B: Backend>(
    generator: &TrajectoryGenerator<B>,
    batch: &TrajectoryBatch<B>,
) -> FakeTrajectory<B> {
    let pred_rel = generator.forward(
        batch.obs_traj.clone(),
        batch.obs_traj_rel.clone(),
        &batch.scene_ranges,
        &batch.scene_ids,
    );
    fake_from_rel(pred_rel, batch)
}

fn fake_from_rel<B: Backend>(pred_rel: Tensor<B, 3>, batch: &TrajectoryBatch<B>) -> FakeTrajectory<B> {
    let pred = relative_to_abs(pred_rel.clone(), last_time_step(batch.obs_traj.clone()));
    FakeTrajectory {
        traj: Tensor::cat(vec![batch.obs_traj.clone(), pred.clone()], 1),
        traj_rel: Tensor::cat(vec![batch.obs_traj_rel.clone(), pred_rel.clone()], 1),
        pred_rel,
        pred,
    }
}

/// Adversarial loss of the discriminator on real versus generated
/// trajectories. The generated side is detached.
pub fn discriminator_loss<B: Backend>(
    generator: &TrajectoryGenerator<B>,
    discriminator: &TrajectoryDiscriminator<B>,
    batch: &TrajectoryBatch<B>,
) -> (Tensor<B, 1>, StepLosses) {
    let pred_rel = sample_fake(generator, batch).pred_rel.detach();
    let fake = fake_from_rel(pred_rel, batch);
    let (traj_real, traj_real_rel) = batch.real_trajectory();

    let scores_fake = discriminator.forward(fake.traj, fake.traj_rel, &batch.scene_ranges);
    let scores_real = discriminator.forward(traj_real, traj_real_rel, &batch.scene_ranges);

    let loss = gan_d_loss(scores_real, scores_fake);
    let value = to_scalar(loss.clone());
    let losses = BTreeMap::from([
        ("D_data_loss".to_string(), value),
        ("D_total_loss".to_string(), value),
    ]);
    (loss, losses)
}

/// Regression of the critic onto collision (and, with geometry, occupancy)
/// counts of the real trajectories, observed and predicted windows together.
pub fn critic_step_loss<B: Backend>(
    critic: &TrajectoryCritic<B>,
    batch: &TrajectoryBatch<B>,
    geometry: Option<&SceneGeometryStore>,
    config: &TrainingConfig,
) -> (Tensor<B, 1>, StepLosses) {
    let (traj_real, traj_real_rel) = batch.real_trajectory();
    let (scores_col, scores_occ) = critic.forward(
        traj_real.clone(),
        traj_real_rel,
        &batch.scene_ranges,
        &batch.scene_ids,
    );
    let mut losses = BTreeMap::new();

    let labels_col = collision_labels(
        traj_real.clone(),
        &batch.scene_ranges,
        config.collision_threshold,
        config.collision_norm,
    );
    let mut loss = critic_loss(scores_col, labels_col);
    losses.insert("C_cols_loss".to_string(), to_scalar(loss.clone()));

    if let Some(geometry) = geometry {
        let labels_occ = occupancy_labels(
            traj_real,
            &batch.scene_ranges,
            &batch.scene_ids,
            geometry,
            config.occupancy_threshold,
            config.occupancy_norm,
        );
        let occs_loss = critic_loss(scores_occ, labels_occ);
        losses.insert("C_occs_loss".to_string(), to_scalar(occs_loss.clone()));
        loss = loss + occs_loss;
    }

    losses.insert("C_total_loss".to_string(), to_scalar(loss.clone()));
    (loss, losses)
}

/// Best-of-k displacement loss plus the weighted adversarial and critic terms,
/// both taken on the last of the `best_k` samples.
pub fn generator_step_loss<B: Backend>(
    generator: &TrajectoryGenerator<B>,
    discriminator: &TrajectoryDiscriminator<B>,
    critic: &TrajectoryCritic<B>,
    batch: &TrajectoryBatch<B>,
    geometry: Option<&SceneGeometryStore>,
    config: &TrainingConfig,
) -> (Tensor<B, 1>, StepLosses) {
    let loss_mask = batch.pred_loss_mask();
    let device = loss_mask.device();
    let mut losses = BTreeMap::new();
    let mut loss = Tensor::<B, 1>::zeros([1], &device);

    let mut l2_samples = Vec::with_capacity(config.best_k);
    let mut fake = sample_fake(generator, batch);
    for sample in 0..config.best_k {
        if sample > 0 {
            fake = sample_fake(generator, batch);
        }
        if config.l2_loss_weight > 0.0 {
            l2_samples.push(
                l2_loss(
                    fake.pred_rel.clone(),
                    batch.pred_traj_gt_rel.clone(),
                    loss_mask.clone(),
                    LossMode::Raw,
                )
                .mul_scalar(config.l2_loss_weight),
            );
        }
    }

    if !l2_samples.is_empty() {
        let l2 = best_of_k_loss(Tensor::stack(l2_samples, 1), &batch.scene_ranges, loss_mask);
        losses.insert("G_l2_loss_rel".to_string(), to_scalar(l2.clone()));
        loss = loss + l2;
    }

    if config.d_loss_weight > 0.0 {
        let scores_fake =
            discriminator.forward(fake.traj.clone(), fake.traj_rel.clone(), &batch.scene_ranges);
        let adversarial = gan_g_loss(scores_fake).mul_scalar(config.d_loss_weight);
        losses.insert("G_discriminator_loss".to_string(), to_scalar(adversarial.clone()));
        loss = loss + adversarial;
    }

    if config.c_loss_weight > 0.0 {
        let (scores_col, scores_occ) =
            critic.forward(fake.traj, fake.traj_rel, &batch.scene_ranges, &batch.scene_ids);
        let mut penalty = scores_col.mean();
        if geometry.is_some() {
            penalty = penalty + scores_occ.mean();
        }
        let penalty = penalty.mul_scalar(config.c_loss_weight);
        losses.insert("G_critic_loss".to_string(), to_scalar(penalty.clone()));
        loss = loss + penalty;
    }

    losses.insert("G_total_loss".to_string(), to_scalar(loss.clone()));
    (loss, losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batchitem::SceneRange;
    use crate::models::critic::TrajectoryCriticConfig;
    use crate::models::discriminator::TrajectoryDiscriminatorConfig;
    use crate::models::generator::TrajectoryGeneratorConfig;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn toy_batch(device: &<TestBackend as Backend>::Device) -> TrajectoryBatch<TestBackend> {
        let obs = Tensor::random([3, 4, 2], Distribution::Default, device);
        let gt = Tensor::random([3, 3, 2], Distribution::Default, device);
        TrajectoryBatch::new(
            obs.clone(),
            gt.clone(),
            obs,
            gt,
            Tensor::from_floats([0.0, 1.0, 0.0], device),
            Tensor::ones([3, 7], device),
            vec![SceneRange::new(0, 2), SceneRange::new(2, 3)],
            vec![0, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_loss_names_follow_enabled_terms() {
        let device = Default::default();
        let batch = toy_batch(&device);
        let generator = TrajectoryGeneratorConfig::new(4, 3)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let discriminator = TrajectoryDiscriminatorConfig::new().init::<TestBackend>(&device);
        let critic = TrajectoryCriticConfig::new()
            .init::<TestBackend>(None, &device)
            .unwrap();

        let config = TrainingConfig::new()
            .with_best_k(3)
            .with_d_loss_weight(0.5)
            .with_c_loss_weight(0.5);
        let (loss, losses) =
            generator_step_loss(&generator, &discriminator, &critic, &batch, None, &config);
        assert_eq!(loss.dims(), [1]);
        for name in ["G_l2_loss_rel", "G_discriminator_loss", "G_critic_loss", "G_total_loss"] {
            assert!(losses.contains_key(name), "missing {name}");
        }

        let (_, losses) = critic_step_loss(&critic, &batch, None, &config);
        assert!(losses.contains_key("C_cols_loss"));
        assert!(!losses.contains_key("C_occs_loss"));

        let (loss, losses) = discriminator_loss(&generator, &discriminator, &batch);
        assert!(to_scalar(loss) >= 0.0);
        assert_eq!(losses["D_data_loss"], losses["D_total_loss"]);
    }
}
