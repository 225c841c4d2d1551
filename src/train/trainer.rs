use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use tracing::{debug, info};

use super::checkpoint::{
    CheckpointLayout, TrainingHistory, CONFIG_FILE, CRITIC_FILE, CRITIC_OPTIM_FILE,
    DISCRIMINATOR_FILE, DISCRIMINATOR_OPTIM_FILE, GENERATOR_FILE, GENERATOR_OPTIM_FILE,
    HISTORY_FILE,
};
use burn::config::Config;
use super::config::TrainingConfig;
use super::evaluate::{evaluate_critic, evaluate_discriminator, evaluate_generator, Metrics};
use super::schedule::{StepKind, StepSchedule};
use super::steps::{critic_step_loss, discriminator_loss, generator_step_loss, StepLosses};
use crate::data::batchitem::TrajectoryBatch;
use crate::error::{Error, Result};
use crate::geometry::SceneGeometryStore;
use crate::models::critic::TrajectoryCritic;
use crate::models::discriminator::TrajectoryDiscriminator;
use crate::models::generator::TrajectoryGenerator;

/// Euclidean norm over all parameter gradients of a module.
struct GradientNorm<'a, B: AutodiffBackend> {
    grads: &'a B::Gradients,
    squared: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if let Some(grad) = tensor.grad(self.grads) {
            self.squared += grad.powf_scalar(2.0).sum().into_scalar().elem::<f32>();
        }
    }
}

fn gradient_norm<B: AutodiffBackend, M: Module<B>>(module: &M, grads: &B::Gradients) -> f32 {
    let mut visitor = GradientNorm::<B> { grads, squared: 0.0 };
    module.visit(&mut visitor);
    visitor.squared.sqrt()
}

/// Multiplies every registered parameter gradient by `scale`.
struct GradientScale<'a> {
    grads: &'a mut GradientsParams,
    scale: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScale<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register(id, grad.mul_scalar(self.scale));
        }
    }
}

/// Rescales all gradients of `module` together so that their global norm
/// `norm` does not exceed `threshold`. A zero threshold disables clipping.
fn clip_global_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: &mut GradientsParams,
    norm: f32,
    threshold: f32,
) {
    if threshold <= 0.0 || norm <= threshold {
        return;
    }
    let mut visitor = GradientScale {
        grads,
        scale: threshold / norm,
    };
    module.visit(&mut visitor);
}

/// Running mean of step losses over one epoch.
#[derive(Debug, Default)]
struct LossAverages {
    sums: StepLosses,
    steps: usize,
}

impl LossAverages {
    fn add(&mut self, losses: &StepLosses) {
        for (name, value) in losses {
            *self.sums.entry(name.clone()).or_default() += value;
        }
        self.steps += 1;
    }

    fn averages(&self) -> StepLosses {
        self.sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / self.steps.max(1) as f32))
            .collect()
    }
}

/// Alternating discriminator / critic / generator optimisation with periodic
/// evaluation and checkpoints.
pub struct GanTrainer<B, OG, OD, OC>
where
    B: AutodiffBackend,
    OG: Optimizer<TrajectoryGenerator<B>, B>,
    OD: Optimizer<TrajectoryDiscriminator<B>, B>,
    OC: Optimizer<TrajectoryCritic<B>, B>,
{
    config: TrainingConfig,
    generator: TrajectoryGenerator<B>,
    discriminator: TrajectoryDiscriminator<B>,
    critic: TrajectoryCritic<B>,
    optim_g: OG,
    optim_d: OD,
    optim_c: OC,
    geometry: Option<Arc<SceneGeometryStore>>,
    layout: CheckpointLayout,
    history: TrainingHistory,
    schedule: StepSchedule,
    device: B::Device,
}

/// Builds a trainer with Adam optimisers, restoring from
/// `config.restore_from` when set.
#[allow(clippy::type_complexity)]
pub fn gan_trainer<B: AutodiffBackend>(
    config: TrainingConfig,
    generator: TrajectoryGenerator<B>,
    discriminator: TrajectoryDiscriminator<B>,
    critic: TrajectoryCritic<B>,
    geometry: Option<Arc<SceneGeometryStore>>,
    device: B::Device,
) -> Result<
    GanTrainer<
        B,
        impl Optimizer<TrajectoryGenerator<B>, B>,
        impl Optimizer<TrajectoryDiscriminator<B>, B>,
        impl Optimizer<TrajectoryCritic<B>, B>,
    >,
> {
    let optim_g = AdamConfig::new().init();
    let optim_d = AdamConfig::new().init();
    let optim_c = AdamConfig::new().init();
    GanTrainer::new(
        config,
        generator,
        discriminator,
        critic,
        optim_g,
        optim_d,
        optim_c,
        geometry,
        device,
    )
}

impl<B, OG, OD, OC> GanTrainer<B, OG, OD, OC>
where
    B: AutodiffBackend,
    OG: Optimizer<TrajectoryGenerator<B>, B>,
    OD: Optimizer<TrajectoryDiscriminator<B>, B>,
    OC: Optimizer<TrajectoryCritic<B>, B>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TrainingConfig,
        generator: TrajectoryGenerator<B>,
        discriminator: TrajectoryDiscriminator<B>,
        critic: TrajectoryCritic<B>,
        optim_g: OG,
        optim_d: OD,
        optim_c: OC,
        geometry: Option<Arc<SceneGeometryStore>>,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        B::seed(config.seed);
        let schedule = StepSchedule::new(config.d_steps, config.c_steps, config.g_steps)?;
        let layout = CheckpointLayout::new(&config.output_dir, config.checkpoint_name.clone());
        let restore_from = config.restore_from.clone().map(PathBuf::from);

        let trainer = Self {
            config,
            generator,
            discriminator,
            critic,
            optim_g,
            optim_d,
            optim_c,
            geometry,
            layout,
            history: TrainingHistory::default(),
            schedule,
            device,
        };

        match restore_from {
            Some(dir) => trainer.restore(&dir),
            None => Ok(trainer),
        }
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn generator(&self) -> &TrajectoryGenerator<B> {
        &self.generator
    }

    fn restore(mut self, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::RestoreNotFound(dir.to_path_buf()));
        }
        info!(path = %dir.display(), "restoring from checkpoint");
        let recorder = CompactRecorder::new();

        self.generator = self
            .generator
            .load_file(dir.join(GENERATOR_FILE), &recorder, &self.device)?;
        self.discriminator =
            self.discriminator
                .load_file(dir.join(DISCRIMINATOR_FILE), &recorder, &self.device)?;
        self.critic = self
            .critic
            .load_file(dir.join(CRITIC_FILE), &recorder, &self.device)?;

        let record = Recorder::<B>::load(&recorder, dir.join(GENERATOR_OPTIM_FILE), &self.device)?;
        self.optim_g = self.optim_g.load_record(record);
        let record =
            Recorder::<B>::load(&recorder, dir.join(DISCRIMINATOR_OPTIM_FILE), &self.device)?;
        self.optim_d = self.optim_d.load_record(record);
        let record = Recorder::<B>::load(&recorder, dir.join(CRITIC_OPTIM_FILE), &self.device)?;
        self.optim_c = self.optim_c.load_record(record);

        self.history = TrainingHistory::load(&dir.join(HISTORY_FILE))?;
        self.history.restore_ts.push(self.history.counters.t);
        Ok(self)
    }

    fn discriminator_step(&mut self, batch: &TrajectoryBatch<B>) -> StepLosses {
        let (loss, losses) = discriminator_loss(&self.generator, &self.discriminator, batch);
        let grads = loss.backward();
        let norm = gradient_norm(&self.discriminator, &grads);
        self.history.norm_d.push(norm);
        let mut grads = GradientsParams::from_grads(grads, &self.discriminator);
        clip_global_norm(
            &self.discriminator,
            &mut grads,
            norm,
            self.config.clipping_threshold_d,
        );
        self.discriminator = self.optim_d.step(
            self.config.d_learning_rate,
            self.discriminator.clone(),
            grads,
        );
        losses
    }

    fn critic_step(&mut self, batch: &TrajectoryBatch<B>) -> StepLosses {
        let (loss, losses) =
            critic_step_loss(&self.critic, batch, self.geometry.as_deref(), &self.config);
        let grads = loss.backward();
        let norm = gradient_norm(&self.critic, &grads);
        self.history.norm_c.push(norm);
        let mut grads = GradientsParams::from_grads(grads, &self.critic);
        clip_global_norm(&self.critic, &mut grads, norm, self.config.clipping_threshold_c);
        self.critic = self
            .optim_c
            .step(self.config.c_learning_rate, self.critic.clone(), grads);
        losses
    }

    fn generator_step(&mut self, batch: &TrajectoryBatch<B>) -> StepLosses {
        let (loss, losses) = generator_step_loss(
            &self.generator,
            &self.discriminator,
            &self.critic,
            batch,
            self.geometry.as_deref(),
            &self.config,
        );
        let grads = loss.backward();
        let norm = gradient_norm(&self.generator, &grads);
        self.history.norm_g.push(norm);
        let mut grads = GradientsParams::from_grads(grads, &self.generator);
        clip_global_norm(&self.generator, &mut grads, norm, self.config.clipping_threshold_g);
        self.generator = self
            .optim_g
            .step(self.config.g_learning_rate, self.generator.clone(), grads);
        losses
    }

    /// Runs epochs until `num_epochs` or `num_iterations` is reached.
    pub fn fit(
        &mut self,
        train: Arc<dyn DataLoader<TrajectoryBatch<B>>>,
        val: Arc<dyn DataLoader<TrajectoryBatch<B::InnerBackend>>>,
    ) -> Result<&TrainingHistory> {
        let mut t = self.history.counters.t;
        let mut epoch = self.history.counters.epoch.map_or(0, |epoch| epoch + 1);

        while t < self.config.num_iterations && epoch < self.config.num_epochs {
            self.schedule.replenish();
            info!(epoch, "starting epoch");
            let mut avg_d = LossAverages::default();
            let mut avg_c = LossAverages::default();
            let mut avg_g = LossAverages::default();

            for batch in train.iter() {
                match self.schedule.next_step() {
                    StepKind::Discriminator => {
                        let losses = self.discriminator_step(&batch);
                        debug!(t, ?losses, "discriminator step");
                        avg_d.add(&losses);
                    }
                    StepKind::Critic => {
                        let losses = self.critic_step(&batch);
                        debug!(t, ?losses, "critic step");
                        avg_c.add(&losses);
                    }
                    StepKind::Generator => {
                        let losses = self.generator_step(&batch);
                        debug!(t, ?losses, "generator step");
                        avg_g.add(&losses);
                    }
                }

                if !self.schedule.finish_cycle() {
                    continue;
                }
                t += 1;
                if t >= self.config.num_iterations {
                    break;
                }
            }

            info!(t, num_iterations = self.config.num_iterations, "epoch done");
            if self.schedule.runs(StepKind::Discriminator) {
                record_losses("D", &mut self.history.d_losses, &avg_d.averages());
            }
            record_losses("G", &mut self.history.g_losses, &avg_g.averages());
            if self.schedule.runs(StepKind::Critic) {
                record_losses("C", &mut self.history.c_losses, &avg_c.averages());
            }
            self.history.losses_ts.push(t);

            if t > 0 && epoch % self.config.checkpoint_every == 0 {
                self.checkpoint(t, epoch, train.as_ref(), val.as_ref())?;
            }
            epoch += 1;
        }

        Ok(&self.history)
    }

    fn evaluate(
        &self,
        split: &str,
        batches: impl Fn() -> Vec<TrajectoryBatch<B::InnerBackend>>,
    ) -> Metrics {
        let geometry = self.geometry.as_deref();
        let mut metrics = Metrics::new();

        if self.schedule.runs(StepKind::Generator) {
            info!(split, "checking generator stats");
            let generator = self.generator.valid();
            metrics.extend(evaluate_generator(&generator, batches(), geometry, &self.config, false));
        }
        if self.schedule.runs(StepKind::Critic) {
            info!(split, "checking critic stats");
            let critic = self.critic.valid();
            metrics.extend(evaluate_critic(&critic, batches(), geometry, &self.config, false));
        }
        if self.schedule.runs(StepKind::Discriminator) {
            info!(split, "checking discriminator stats");
            let generator = self.generator.valid();
            let discriminator = self.discriminator.valid();
            metrics.extend(evaluate_discriminator(
                &generator,
                &discriminator,
                batches(),
                &self.config,
                true,
            ));
        }
        metrics
    }

    fn checkpoint(
        &mut self,
        t: usize,
        epoch: usize,
        train: &dyn DataLoader<TrajectoryBatch<B>>,
        val: &dyn DataLoader<TrajectoryBatch<B::InnerBackend>>,
    ) -> Result<()> {
        self.history.counters.t = t;
        self.history.counters.epoch = Some(epoch);
        self.history.sample_ts.push(t);

        let metrics_train = self.evaluate("train", || train.iter().map(|batch| batch.inner()).collect());
        let metrics_val = self.evaluate("val", || val.iter().collect());
        log_metrics("val", &metrics_val);
        log_metrics("train", &metrics_train);
        TrainingHistory::append(&mut self.history.metrics_val, &metrics_val);
        TrainingHistory::append(&mut self.history.metrics_train, &metrics_train);

        fs::create_dir_all(&self.config.output_dir)?;
        let with_model = self.layout.with_model_dir(epoch);
        self.save_models(&with_model)?;
        self.save_optimizers(&with_model)?;
        self.history.save(&with_model.join(HISTORY_FILE))?;
        info!(path = %with_model.display(), "saved checkpoint");

        let no_model = self.layout.no_model_path(epoch);
        self.history.save(&no_model)?;
        info!(path = %no_model.display(), "saved checkpoint");

        if !self.schedule.runs(StepKind::Generator) {
            return Ok(());
        }
        if self.history.is_new_val_low("ade") {
            info!(t, "new low for avg_disp_error");
            self.history.best_t = Some(t);
            self.save_models(&self.layout.best_dir())?;
        }
        if self.history.is_new_val_low("ade_nl") {
            info!(t, "new low for avg_disp_error_nl");
            self.history.best_t_nl = Some(t);
            self.save_models(&self.layout.best_nl_dir())?;
        }
        Ok(())
    }

    fn save_models(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let recorder = CompactRecorder::new();
        self.generator
            .clone()
            .save_file(dir.join(GENERATOR_FILE), &recorder)?;
        self.discriminator
            .clone()
            .save_file(dir.join(DISCRIMINATOR_FILE), &recorder)?;
        self.critic.clone().save_file(dir.join(CRITIC_FILE), &recorder)?;
        self.config.save(dir.join(CONFIG_FILE))?;
        Ok(())
    }

    fn save_optimizers(&self, dir: &Path) -> Result<()> {
        let recorder = CompactRecorder::new();
        Recorder::<B>::record(&recorder, self.optim_g.to_record(), dir.join(GENERATOR_OPTIM_FILE))?;
        Recorder::<B>::record(
            &recorder,
            self.optim_d.to_record(),
            dir.join(DISCRIMINATOR_OPTIM_FILE),
        )?;
        Recorder::<B>::record(&recorder, self.optim_c.to_record(), dir.join(CRITIC_OPTIM_FILE))?;
        Ok(())
    }
}

fn record_losses(tag: &str, history: &mut BTreeMap<String, Vec<f32>>, averages: &StepLosses) {
    for (name, value) in averages {
        info!("  [{tag}] {name}: {value:.3}");
    }
    TrainingHistory::append(history, averages);
}

fn log_metrics(split: &str, metrics: &Metrics) {
    for (name, value) in metrics {
        info!("  [{split}] {name}: {value:.3}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::scene_sample::{PedestrianTrack, SceneSample, TrajectoryBatcher};
    use crate::models::critic::TrajectoryCriticConfig;
    use crate::models::discriminator::TrajectoryDiscriminatorConfig;
    use crate::models::generator::TrajectoryGeneratorConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::DataLoaderBuilder;
    use burn::data::dataset::InMemDataset;
    use burn::module::Param;

    type TrainBackend = Autodiff<NdArray>;

    fn scenes() -> Vec<SceneSample> {
        (0..4)
            .map(|scene| SceneSample {
                scene_id: 0,
                pedestrians: (0..2)
                    .map(|ped| PedestrianTrack {
                        positions: (0..5)
                            .map(|t| [t as f32 * 0.3, ped as f32 + scene as f32 * 0.1])
                            .collect(),
                        non_linear: ped == 1,
                        loss_mask: None,
                    })
                    .collect(),
            })
            .collect()
    }

    fn models(
        device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
    ) -> (
        TrajectoryGenerator<TrainBackend>,
        TrajectoryDiscriminator<TrainBackend>,
        TrajectoryCritic<TrainBackend>,
    ) {
        (
            TrajectoryGeneratorConfig::new(3, 2)
                .with_noise_dim(4)
                .init(None, device)
                .unwrap(),
            TrajectoryDiscriminatorConfig::new().init(device),
            TrajectoryCriticConfig::new().init(None, device).unwrap(),
        )
    }

    #[test]
    fn test_fit_writes_checkpoints_and_restores() {
        let device = Default::default();
        let dir = std::env::temp_dir().join("safegan_trainer_test");
        let _ = fs::remove_dir_all(&dir);

        let train = DataLoaderBuilder::new(TrajectoryBatcher::<TrainBackend>::new(device, 3, 2))
            .batch_size(1)
            .build(InMemDataset::new(scenes()));
        let val = DataLoaderBuilder::new(TrajectoryBatcher::<NdArray>::new(Default::default(), 3, 2))
            .batch_size(2)
            .build(InMemDataset::new(scenes()));

        let config = TrainingConfig::new()
            .with_num_epochs(2)
            .with_d_steps(1)
            .with_c_steps(1)
            .with_g_steps(1)
            .with_best_k(2)
            .with_checkpoint_every(1)
            .with_output_dir(dir.to_string_lossy().into_owned())
            .with_checkpoint_name("toy".to_string());

        let (generator, discriminator, critic) = models(&device);
        let mut trainer =
            gan_trainer(config.clone(), generator, discriminator, critic, None, device).unwrap();
        let history = trainer.fit(train, val).unwrap().clone();

        // four batches per epoch, one full d/c/g cycle each
        assert_eq!(history.counters.t, 2);
        assert_eq!(history.losses_ts, vec![1, 2]);
        assert_eq!(history.norm_g.len(), 2);
        assert!(history.metrics_val.contains_key("ade"));
        assert!(history.metrics_val.contains_key("d_loss"));
        assert!(history.metrics_val.contains_key("c_loss"));
        assert!(history.best_t.is_some());

        let layout = CheckpointLayout::new(&dir, "toy");
        assert!(layout.with_model_dir(1).join(HISTORY_FILE).is_file());
        assert!(layout.no_model_path(1).is_file());
        assert!(layout.best_dir().is_dir());

        let (generator, discriminator, critic) = models(&device);
        let restored = gan_trainer(
            config.with_restore_from(Some(layout.with_model_dir(1).to_string_lossy().into_owned())),
            generator,
            discriminator,
            critic,
            None,
            device,
        )
        .unwrap();
        assert_eq!(restored.history().restore_ts, vec![2]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[derive(Module, Debug)]
    struct TwoParams<B: burn::tensor::backend::Backend> {
        a: Param<Tensor<B, 1>>,
        b: Param<Tensor<B, 1>>,
    }

    #[test]
    fn test_clipping_uses_global_norm() {
        let device = Default::default();
        let module = TwoParams::<TrainBackend> {
            a: Param::from_tensor(Tensor::ones([1], &device)),
            b: Param::from_tensor(Tensor::ones([1], &device)),
        };
        // each gradient is 1.5, below the threshold on its own
        let loss = (module.a.val() + module.b.val()).sum().mul_scalar(1.5);
        let grads = loss.backward();
        let norm = gradient_norm(&module, &grads);
        assert!((norm - 4.5f32.sqrt()).abs() < 1e-5);

        let mut grads = GradientsParams::from_grads(grads, &module);
        clip_global_norm(&module, &mut grads, norm, 2.0);

        let a = grads.get::<NdArray, 1>(module.a.id).unwrap().into_scalar();
        let b = grads.get::<NdArray, 1>(module.b.id).unwrap().into_scalar();
        assert!((a - 2.0f32.sqrt()).abs() < 1e-5);
        assert!((b - 2.0f32.sqrt()).abs() < 1e-5);
        assert!(((a * a + b * b).sqrt() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_clipping_leaves_small_gradients() {
        let device = Default::default();
        let module = TwoParams::<TrainBackend> {
            a: Param::from_tensor(Tensor::ones([1], &device)),
            b: Param::from_tensor(Tensor::ones([1], &device)),
        };
        let loss = (module.a.val() + module.b.val()).sum().mul_scalar(0.5);
        let grads = loss.backward();
        let norm = gradient_norm(&module, &grads);
        let mut grads = GradientsParams::from_grads(grads, &module);
        clip_global_norm(&module, &mut grads, norm, 2.0);

        let a = grads.get::<NdArray, 1>(module.a.id).unwrap().into_scalar();
        assert!((a - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_restore_target_fails() {
        let device = Default::default();
        let (generator, discriminator, critic) = models(&device);
        let config = TrainingConfig::new().with_restore_from(Some("/nonexistent/safegan".into()));
        let result = gan_trainer(config, generator, discriminator, critic, None, device);
        assert!(matches!(result, Err(Error::RestoreNotFound(_))));
    }
}
