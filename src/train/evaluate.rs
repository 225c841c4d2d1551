use std::collections::BTreeMap;

use burn::tensor::backend::Backend;

use super::config::TrainingConfig;
use super::steps::{critic_step_loss, discriminator_loss, sample_fake};
use crate::data::batchitem::TrajectoryBatch;
use crate::geometry::SceneGeometryStore;
use crate::models::critic::TrajectoryCritic;
use crate::models::discriminator::TrajectoryDiscriminator;
use crate::models::generator::TrajectoryGenerator;
use crate::scoring::{collision_counts, occupancy_counts, Trajectories};
use crate::utils::{
    displacement_error, final_displacement_error, l2_loss, last_time_step, to_scalar, LossMode,
};

pub type Metrics = BTreeMap<String, f32>;

fn ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct GeneratorTotals {
    l2_abs: f32,
    l2_rel: f32,
    ade: f32,
    ade_l: f32,
    ade_nl: f32,
    fde: f32,
    fde_l: f32,
    fde_nl: f32,
    cols: f32,
    cols_gt: f32,
    occs: f32,
    occs_gt: f32,
    loss_mask_sum: f32,
    traj: f32,
    traj_l: f32,
    traj_nl: f32,
}

/// Displacement, collision and occupancy metrics of one sample per batch.
/// With `limit`, stops after `num_samples_check` pedestrians.
pub fn evaluate_generator<B: Backend>(
    generator: &TrajectoryGenerator<B>,
    batches: impl IntoIterator<Item = TrajectoryBatch<B>>,
    geometry: Option<&SceneGeometryStore>,
    config: &TrainingConfig,
    limit: bool,
) -> Metrics {
    let mut totals = GeneratorTotals::default();
    let pred_len = generator.pred_len() as f32;

    for batch in batches {
        let loss_mask = batch.pred_loss_mask();
        let linear_ped = batch.linear_ped();
        let fake = sample_fake(generator, &batch);

        totals.l2_abs += to_scalar(l2_loss(
            fake.pred.clone(),
            batch.pred_traj_gt.clone(),
            loss_mask.clone(),
            LossMode::Sum,
        ));
        totals.l2_rel += to_scalar(l2_loss(
            fake.pred_rel,
            batch.pred_traj_gt_rel.clone(),
            loss_mask.clone(),
            LossMode::Sum,
        ));

        totals.ade += to_scalar(displacement_error(fake.pred.clone(), batch.pred_traj_gt.clone(), None));
        totals.ade_l += to_scalar(displacement_error(
            fake.pred.clone(),
            batch.pred_traj_gt.clone(),
            Some(linear_ped.clone()),
        ));
        totals.ade_nl += to_scalar(displacement_error(
            fake.pred.clone(),
            batch.pred_traj_gt.clone(),
            Some(batch.non_linear_ped.clone()),
        ));

        let final_fake = last_time_step(fake.pred.clone());
        let final_gt = last_time_step(batch.pred_traj_gt.clone());
        totals.fde += to_scalar(final_displacement_error(final_fake.clone(), final_gt.clone(), None));
        totals.fde_l += to_scalar(final_displacement_error(
            final_fake.clone(),
            final_gt.clone(),
            Some(linear_ped.clone()),
        ));
        totals.fde_nl += to_scalar(final_displacement_error(
            final_fake,
            final_gt,
            Some(batch.non_linear_ped.clone()),
        ));

        let pred = Trajectories::from_tensor(fake.pred);
        let gt = Trajectories::from_tensor(batch.pred_traj_gt.clone());
        let cols = |traj: &Trajectories| -> f32 {
            collision_counts(traj, &batch.scene_ranges, config.collision_threshold, config.collision_norm)
                .iter()
                .sum()
        };
        totals.cols += cols(&pred);
        totals.cols_gt += cols(&gt);

        if let Some(geometry) = geometry {
            let occs = |traj: &Trajectories| -> f32 {
                occupancy_counts(
                    traj,
                    &batch.scene_ranges,
                    &batch.scene_ids,
                    geometry,
                    config.occupancy_threshold,
                    config.occupancy_norm,
                )
                .iter()
                .sum()
            };
            totals.occs += occs(&pred);
            totals.occs_gt += occs(&gt);
        }

        let [num_peds, steps] = loss_mask.dims();
        totals.loss_mask_sum += (num_peds * steps) as f32;
        totals.traj += num_peds as f32;
        totals.traj_l += to_scalar(linear_ped.sum());
        totals.traj_nl += to_scalar(batch.non_linear_ped.clone().sum());

        if limit && totals.traj >= config.num_samples_check as f32 {
            break;
        }
    }

    let mut metrics = Metrics::new();
    metrics.insert("g_l2_loss_abs".into(), ratio(totals.l2_abs, totals.loss_mask_sum));
    metrics.insert("g_l2_loss_rel".into(), ratio(totals.l2_rel, totals.loss_mask_sum));
    metrics.insert("ade".into(), ratio(totals.ade, totals.traj * pred_len));
    metrics.insert("fde".into(), ratio(totals.fde, totals.traj));
    metrics.insert("ade_l".into(), ratio(totals.ade_l, totals.traj_l * pred_len));
    metrics.insert("fde_l".into(), ratio(totals.fde_l, totals.traj_l));
    metrics.insert("ade_nl".into(), ratio(totals.ade_nl, totals.traj_nl * pred_len));
    metrics.insert("fde_nl".into(), ratio(totals.fde_nl, totals.traj_nl));
    metrics.insert("cols".into(), ratio(totals.cols, totals.traj));
    metrics.insert("cols_gt".into(), ratio(totals.cols_gt, totals.traj));
    if geometry.is_some() {
        metrics.insert("occs".into(), ratio(totals.occs, totals.traj));
        metrics.insert("occs_gt".into(), ratio(totals.occs_gt, totals.traj));
    }
    metrics
}

/// Critic loss against full-trajectory labels, plus ground-truth collision
/// and occupancy rates over the prediction window.
pub fn evaluate_critic<B: Backend>(
    critic: &TrajectoryCritic<B>,
    batches: impl IntoIterator<Item = TrajectoryBatch<B>>,
    geometry: Option<&SceneGeometryStore>,
    config: &TrainingConfig,
    limit: bool,
) -> Metrics {
    let mut losses = Vec::new();
    let mut cols_gt = 0.0;
    let mut occs_gt = 0.0;
    let mut total_traj = 0.0;

    for batch in batches {
        let (loss, _) = critic_step_loss(critic, &batch, geometry, config);
        losses.push(to_scalar(loss));

        let gt = Trajectories::from_tensor(batch.pred_traj_gt.clone());
        cols_gt += collision_counts(&gt, &batch.scene_ranges, config.collision_threshold, config.collision_norm)
            .iter()
            .sum::<f32>();
        if let Some(geometry) = geometry {
            occs_gt += occupancy_counts(
                &gt,
                &batch.scene_ranges,
                &batch.scene_ids,
                geometry,
                config.occupancy_threshold,
                config.occupancy_norm,
            )
            .iter()
            .sum::<f32>();
        }
        total_traj += batch.num_pedestrians() as f32;

        if limit && total_traj >= config.num_samples_check as f32 {
            break;
        }
    }

    let mut metrics = Metrics::new();
    metrics.insert("cols_gt".into(), ratio(cols_gt, total_traj));
    if geometry.is_some() {
        metrics.insert("occs_gt".into(), ratio(occs_gt, total_traj));
    }
    metrics.insert(
        "c_loss".into(),
        ratio(losses.iter().sum(), losses.len() as f32),
    );
    metrics
}

pub fn evaluate_discriminator<B: Backend>(
    generator: &TrajectoryGenerator<B>,
    discriminator: &TrajectoryDiscriminator<B>,
    batches: impl IntoIterator<Item = TrajectoryBatch<B>>,
    config: &TrainingConfig,
    limit: bool,
) -> Metrics {
    let mut losses = Vec::new();
    let mut total_traj = 0;

    for batch in batches {
        let (loss, _) = discriminator_loss(generator, discriminator, &batch);
        losses.push(to_scalar(loss));
        total_traj += batch.num_pedestrians();

        if limit && total_traj >= config.num_samples_check {
            break;
        }
    }

    Metrics::from([(
        "d_loss".to_string(),
        ratio(losses.iter().sum(), losses.len() as f32),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batchitem::SceneRange;
    use crate::geometry::SceneGeometry;
    use crate::models::generator::TrajectoryGeneratorConfig;
    use crate::models::critic::TrajectoryCriticConfig;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray;

    fn still_batch() -> TrajectoryBatch<TestBackend> {
        let device = Default::default();
        TrajectoryBatch::new(
            Tensor::zeros([2, 3, 2], &device),
            Tensor::zeros([2, 2, 2], &device),
            Tensor::zeros([2, 3, 2], &device),
            Tensor::zeros([2, 2, 2], &device),
            Tensor::zeros([2], &device),
            Tensor::ones([2, 5], &device),
            vec![SceneRange::new(0, 2)],
            vec![0],
        )
        .unwrap()
    }

    #[test]
    fn test_generator_metrics_without_non_linear_peds() {
        let device = Default::default();
        let generator = TrajectoryGeneratorConfig::new(3, 2)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let metrics = evaluate_generator(
            &generator,
            vec![still_batch(), still_batch()],
            None,
            &TrainingConfig::new(),
            false,
        );

        for name in ["ade", "fde", "ade_l", "g_l2_loss_abs", "g_l2_loss_rel"] {
            assert!(metrics[name].is_finite() && metrics[name] >= 0.0);
        }
        assert_eq!(metrics["ade_nl"], 0.0);
        assert_eq!(metrics["fde_nl"], 0.0);
        // both ground-truth pedestrians stand on the same spot for 2 steps
        assert_eq!(metrics["cols_gt"], 2.0);
        assert!(!metrics.contains_key("occs"));
    }

    #[test]
    fn test_critic_metrics() {
        let device = Default::default();
        let critic = TrajectoryCriticConfig::new()
            .init::<TestBackend>(None, &device)
            .unwrap();
        let metrics = evaluate_critic(&critic, vec![still_batch()], None, &TrainingConfig::new(), true);
        assert_eq!(metrics["cols_gt"], 2.0);
        assert!(metrics["c_loss"].is_finite());
    }

    #[test]
    fn test_ground_truth_occupancy_uses_prediction_window() {
        let device = Default::default();
        let store = SceneGeometryStore::new(vec![(
            "a".to_string(),
            SceneGeometry::points(vec![[0.0, 0.0]]),
        )]);
        // observed on the boundary point, predicted far away from it
        let batch = TrajectoryBatch::<TestBackend>::new(
            Tensor::zeros([2, 3, 2], &device),
            Tensor::ones([2, 2, 2], &device).mul_scalar(5.0),
            Tensor::zeros([2, 3, 2], &device),
            Tensor::zeros([2, 2, 2], &device),
            Tensor::zeros([2], &device),
            Tensor::ones([2, 5], &device),
            vec![SceneRange::new(0, 2)],
            vec![0],
        )
        .unwrap();
        let config = TrainingConfig::new();

        let generator = TrajectoryGeneratorConfig::new(3, 2)
            .init::<TestBackend>(None, &device)
            .unwrap();
        let critic = TrajectoryCriticConfig::new()
            .init::<TestBackend>(None, &device)
            .unwrap();
        let from_generator =
            evaluate_generator(&generator, vec![batch.clone()], Some(&store), &config, false);
        let from_critic = evaluate_critic(&critic, vec![batch], Some(&store), &config, false);

        assert_eq!(from_generator["occs_gt"], 0.0);
        assert_eq!(from_critic["occs_gt"], from_generator["occs_gt"]);
    }
}
