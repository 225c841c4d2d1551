use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor, TensorData};

use crate::data::batchitem::SceneRange;

/// Copies a float tensor to the host, row-major.
pub fn tensor_to_vec<B: Backend, const D: usize>(x: Tensor<B, D>) -> Vec<f32> {
    let data = x.into_data();
    let values: Vec<f32> = data.iter::<f32>().collect();
    values
}

/// Reads a single-element tensor.
pub fn to_scalar<B: Backend>(x: Tensor<B, 1>) -> f32 {
    x.into_scalar().elem::<f32>()
}

pub fn index_tensor<B: Backend>(indices: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let len = indices.len();
    Tensor::from_data(TensorData::new(indices, [len]), device)
}

/// Repeats each row `reps` times in place: R1, R1, R2, R2.
pub fn repeat_rows<B: Backend>(x: Tensor<B, 2>, reps: usize) -> Tensor<B, 2> {
    let rows = x.dims()[0];
    let indices = (0..rows as i64)
        .flat_map(|row| std::iter::repeat(row).take(reps))
        .collect();
    let indices = index_tensor::<B>(indices, &x.device());
    x.select(0, indices)
}

/// Tiles the whole tensor `reps` times along rows: R1, R2, R1, R2.
pub fn tile_rows<B: Backend>(x: Tensor<B, 2>, reps: usize) -> Tensor<B, 2> {
    let rows = x.dims()[0];
    let indices = (0..reps).flat_map(|_| 0..rows as i64).collect();
    let indices = index_tensor::<B>(indices, &x.device());
    x.select(0, indices)
}

/// Selects time step `step` of a `[N, T, C]` tensor as `[N, C]`.
pub fn time_step<B: Backend>(x: Tensor<B, 3>, step: usize) -> Tensor<B, 2> {
    let [n, _, c] = x.dims();
    x.slice([0..n, step..step + 1, 0..c]).squeeze(1)
}

pub fn last_time_step<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 2> {
    let t = x.dims()[1];
    time_step(x, t - 1)
}

/// Integrates relative displacements `[N, T, 2]` from `start` `[N, 2]`.
///
/// Position `t` is exactly `position[t - 1] + rel[t]`, accumulated in order.
pub fn relative_to_abs<B: Backend>(rel: Tensor<B, 3>, start: Tensor<B, 2>) -> Tensor<B, 3> {
    let steps = rel.dims()[1];
    let mut current = start;
    let mut positions = Vec::with_capacity(steps);
    for step in 0..steps {
        current = current + time_step(rel.clone(), step);
        positions.push(current.clone());
    }
    Tensor::stack(positions, 1)
}

pub fn masked_average<B: Backend>(x: Tensor<B, 2>, weights: Tensor<B, 2>) -> Tensor<B, 1> {
    let sum_weights = weights.clone().sum().clamp_min(1.0);
    (x * weights).sum() / sum_weights
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossMode {
    /// One value per pedestrian, `[N]`.
    Raw,
    Sum,
    Average,
}

/// Squared L2 error between two `[N, T, 2]` trajectories, masked by `[N, T]`.
pub fn l2_loss<B: Backend>(
    pred: Tensor<B, 3>,
    target: Tensor<B, 3>,
    loss_mask: Tensor<B, 2>,
    mode: LossMode,
) -> Tensor<B, 1> {
    let squared: Tensor<B, 2> = (target - pred).powf_scalar(2.0).sum_dim(2).squeeze(2);
    match mode {
        LossMode::Raw => (squared * loss_mask).sum_dim(1).squeeze(1),
        LossMode::Sum => (squared * loss_mask).sum(),
        LossMode::Average => masked_average(squared, loss_mask),
    }
}

fn pedestrian_weights<B: Backend>(
    per_ped: Tensor<B, 1>,
    consider_ped: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    match consider_ped {
        Some(weights) => (per_ped * weights).sum(),
        None => per_ped.sum(),
    }
}

/// Summed Euclidean error over all steps and pedestrians (ADE numerator).
pub fn displacement_error<B: Backend>(
    pred: Tensor<B, 3>,
    target: Tensor<B, 3>,
    consider_ped: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let distances: Tensor<B, 2> = (target - pred)
        .powf_scalar(2.0)
        .sum_dim(2)
        .squeeze::<2>(2)
        .sqrt();
    pedestrian_weights(distances.sum_dim(1).squeeze(1), consider_ped)
}

/// Summed Euclidean error at the final step (FDE numerator).
pub fn final_displacement_error<B: Backend>(
    pred_pos: Tensor<B, 2>,
    target_pos: Tensor<B, 2>,
    consider_ped: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let distances: Tensor<B, 1> = (target_pos - pred_pos)
        .powf_scalar(2.0)
        .sum_dim(1)
        .squeeze::<1>(1)
        .sqrt();
    pedestrian_weights(distances, consider_ped)
}

/// Numerically stable binary cross entropy on logits, averaged.
pub fn bce_with_logits<B: Backend>(input: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let neg_abs = input.clone().abs().neg();
    let loss = input.clone().clamp_min(0.0) - input * target + neg_abs.exp().add_scalar(1.0).log();
    loss.mean()
}

pub fn gan_g_loss<B: Backend>(scores_fake: Tensor<B, 2>) -> Tensor<B, 1> {
    let target = scores_fake.ones_like();
    bce_with_logits(scores_fake, target)
}

pub fn gan_d_loss<B: Backend>(scores_real: Tensor<B, 2>, scores_fake: Tensor<B, 2>) -> Tensor<B, 1> {
    let real_target = scores_real.ones_like();
    let fake_target = scores_fake.zeros_like();
    bce_with_logits(scores_real, real_target) + bce_with_logits(scores_fake, fake_target)
}

/// Regression of critic scores onto collision / occupancy labels.
pub fn critic_loss<B: Backend>(scores: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    (scores - labels).powf_scalar(2.0).mean()
}

/// Best-of-k displacement loss.
///
/// `losses` is `[N, k]`, one raw loss per pedestrian per sample. For every
/// scene the per-sample losses are summed over the scene's pedestrians, the
/// cheapest sample is kept and normalized by the scene's mask weight; the
/// scene minima are summed.
pub fn best_of_k_loss<B: Backend>(
    losses: Tensor<B, 2>,
    ranges: &[SceneRange],
    loss_mask: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [_, k] = losses.dims();
    let steps = loss_mask.dims()[1];
    let mut total = Tensor::<B, 1>::zeros([1], &losses.device());
    for range in ranges {
        let scene_losses = losses.clone().slice([range.start..range.end, 0..k]);
        let scene_min = scene_losses.sum_dim(0).min();
        let scene_weight = loss_mask
            .clone()
            .slice([range.start..range.end, 0..steps])
            .sum()
            .clamp_min(1.0);
        total = total + scene_min / scene_weight;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tensor3(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_relative_to_abs_accumulates_in_order() {
        let rel = vec![0.1, 0.2, 0.3, -0.4, 1e-3, 7.5, -2.0, 0.0, 0.25, 0.125, 3.0, -1.0];
        let start = vec![1.5f32, -2.25, 10.0, 0.5];
        let out = relative_to_abs(
            tensor3(rel.clone(), [2, 3, 2]),
            Tensor::from_data(TensorData::new(start.clone(), [2, 2]), &Default::default()),
        );
        let out = tensor_to_vec(out);

        for ped in 0..2 {
            let mut pos = [start[ped * 2], start[ped * 2 + 1]];
            for t in 0..3 {
                for c in 0..2 {
                    pos[c] += rel[(ped * 3 + t) * 2 + c];
                    assert_eq!(out[(ped * 3 + t) * 2 + c], pos[c]);
                }
            }
        }
    }

    #[test]
    fn test_repeat_and_tile_rows() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0f32, 2.0], [2, 1]), &device);

        assert_eq!(tensor_to_vec(repeat_rows(x.clone(), 2)), vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(tensor_to_vec(tile_rows(x, 2)), vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_l2_loss_respects_mask() {
        let device = Default::default();
        let pred = tensor3(vec![0.0; 8], [2, 2, 2]);
        let target = tensor3(vec![1.0, 0.0, 0.0, 2.0, 3.0, 4.0, 1.0, 1.0], [2, 2, 2]);
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 1.0], [2, 2]),
            &device,
        );

        let raw = tensor_to_vec(l2_loss(pred.clone(), target.clone(), mask.clone(), LossMode::Raw));
        assert_eq!(raw, vec![5.0, 2.0]);

        let sum = tensor_to_vec(l2_loss(pred.clone(), target.clone(), mask.clone(), LossMode::Sum));
        assert_eq!(sum, vec![7.0]);

        let avg = tensor_to_vec(l2_loss(pred, target, mask, LossMode::Average));
        assert!((avg[0] - 7.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_displacement_errors() {
        let device = Default::default();
        let pred = tensor3(vec![0.0; 8], [2, 2, 2]);
        let target = tensor3(vec![3.0, 4.0, 0.0, 1.0, 0.0, 2.0, 6.0, 8.0], [2, 2, 2]);
        let linear = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![1.0f32, 0.0], [2]),
            &device,
        );

        let ade = tensor_to_vec(displacement_error(pred.clone(), target.clone(), None));
        assert!((ade[0] - 18.0).abs() < 1e-5);

        let ade_l = tensor_to_vec(displacement_error(pred.clone(), target.clone(), Some(linear.clone())));
        assert!((ade_l[0] - 6.0).abs() < 1e-5);

        let fde = tensor_to_vec(final_displacement_error(
            last_time_step(pred),
            last_time_step(target),
            Some(linear),
        ));
        assert!((fde[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_best_of_k_picks_cheapest_sample_per_scene() {
        let device = Default::default();
        // Two scenes: peds 0-1 and ped 2. Sample 2 (index 1) is cheapest for
        // scene one, sample index 2 for scene two.
        let losses = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(
                vec![
                    4.0f32, 1.0, 3.0, //
                    2.0, 0.5, 3.0, //
                    9.0, 8.0, 7.0,
                ],
                [3, 3],
            ),
            &device,
        );
        let mask = Tensor::<TestBackend, 2>::ones([3, 2], &device);
        let ranges = [SceneRange::new(0, 2), SceneRange::new(2, 3)];

        let loss = tensor_to_vec(best_of_k_loss(losses, &ranges, mask));
        let expected = 1.5 / 4.0 + 7.0 / 2.0;
        assert!((loss[0] - expected).abs() < 1e-6, "loss {:?}", loss);
    }

    #[test]
    fn test_best_of_k_is_per_scene_not_per_pedestrian() {
        let device = Default::default();
        // Per pedestrian minima would pick 1.0 + 1.0; per scene the best
        // sample sums to 5.0.
        let losses = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 4.0, 10.0, 1.0], [2, 2]),
            &device,
        );
        let mask = Tensor::<TestBackend, 2>::ones([2, 1], &device);
        let loss = tensor_to_vec(best_of_k_loss(losses, &[SceneRange::new(0, 2)], mask));
        assert!((loss[0] - 5.0 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_gan_losses_are_finite() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![-50.0f32, 0.0, 50.0], [3, 1]),
            &device,
        );
        let g = tensor_to_vec(gan_g_loss(scores.clone()));
        let d = tensor_to_vec(gan_d_loss(scores.clone(), scores));
        assert!(g[0].is_finite());
        assert!(d[0].is_finite());
    }
}
