use burn::config::Config;

use crate::error::Error;
use crate::scoring::DistanceNorm;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 201)]
    pub num_epochs: usize,

    /// Upper bound on completed d/c/g cycles.
    #[config(default = 10000)]
    pub num_iterations: usize,

    #[config(default = 0)]
    pub d_steps: usize,

    #[config(default = 0)]
    pub c_steps: usize,

    #[config(default = 1)]
    pub g_steps: usize,

    #[config(default = 1e-4)]
    pub g_learning_rate: f64,

    #[config(default = 5e-3)]
    pub d_learning_rate: f64,

    #[config(default = 5e-3)]
    pub c_learning_rate: f64,

    /// Gradient clipping thresholds, disabled at zero.
    #[config(default = 2.0)]
    pub clipping_threshold_g: f32,

    #[config(default = 0.0)]
    pub clipping_threshold_d: f32,

    #[config(default = 0.0)]
    pub clipping_threshold_c: f32,

    #[config(default = 1.0)]
    pub l2_loss_weight: f32,

    /// Weight of the adversarial term in the generator loss.
    #[config(default = 0.0)]
    pub d_loss_weight: f32,

    /// Weight of the critic penalty in the generator loss.
    #[config(default = 0.0)]
    pub c_loss_weight: f32,

    #[config(default = 20)]
    pub best_k: usize,

    #[config(default = 0.10)]
    pub collision_threshold: f32,

    #[config(default = 0.05)]
    pub occupancy_threshold: f32,

    #[config(default = "DistanceNorm::L1")]
    pub collision_norm: DistanceNorm,

    /// Distance used against scene boundary points.
    #[config(default = "DistanceNorm::L1")]
    pub occupancy_norm: DistanceNorm,

    #[config(default = 20)]
    pub checkpoint_every: usize,

    /// Pedestrians looked at by limited evaluation passes.
    #[config(default = 100)]
    pub num_samples_check: usize,

    #[config(default = "String::from(\"checkpoints\")")]
    pub output_dir: String,

    #[config(default = "String::from(\"checkpoint\")")]
    pub checkpoint_name: String,

    /// A `<name>_<epoch>_with_model` directory to resume from.
    pub restore_from: Option<String>,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.best_k == 0 {
            return Err(Error::config("best_k must be at least 1"));
        }
        if self.d_steps + self.c_steps + self.g_steps == 0 {
            return Err(Error::config("at least one of d_steps, c_steps, g_steps must be positive"));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::config("checkpoint_every must be at least 1"));
        }
        for (name, value) in [
            ("collision_threshold", self.collision_threshold),
            ("occupancy_threshold", self.occupancy_threshold),
            ("clipping_threshold_g", self.clipping_threshold_g),
            ("clipping_threshold_d", self.clipping_threshold_d),
            ("clipping_threshold_c", self.clipping_threshold_c),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::config(format!("{name} must be non-negative, got {value}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.best_k, 20);
        assert_eq!(config.collision_norm, DistanceNorm::L1);
        assert_eq!(config.occupancy_norm, DistanceNorm::L1);
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(TrainingConfig::new().with_best_k(0).validate().is_err());
        assert!(TrainingConfig::new().with_g_steps(0).validate().is_err());
        assert!(TrainingConfig::new()
            .with_collision_threshold(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_restore_path() {
        let config = TrainingConfig::new().with_restore_from(Some("runs/a_20_with_model".into()));
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.restore_from.as_deref(), Some("runs/a_20_with_model"));
    }
}
