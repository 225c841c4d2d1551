use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const HISTORY_FILE: &str = "history.json";
pub const CONFIG_FILE: &str = "config.json";
pub const GENERATOR_FILE: &str = "generator";
pub const DISCRIMINATOR_FILE: &str = "discriminator";
pub const CRITIC_FILE: &str = "critic";
pub const GENERATOR_OPTIM_FILE: &str = "generator_optim";
pub const DISCRIMINATOR_OPTIM_FILE: &str = "discriminator_optim";
pub const CRITIC_OPTIM_FILE: &str = "critic_optim";

pub type LossHistory = BTreeMap<String, Vec<f32>>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub t: usize,
    pub epoch: Option<usize>,
}

/// Everything a checkpoint keeps besides parameter tensors.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    #[serde(rename = "G_losses")]
    pub g_losses: LossHistory,
    #[serde(rename = "D_losses")]
    pub d_losses: LossHistory,
    #[serde(rename = "C_losses")]
    pub c_losses: LossHistory,
    pub losses_ts: Vec<usize>,
    pub metrics_val: LossHistory,
    pub metrics_train: LossHistory,
    pub sample_ts: Vec<usize>,
    pub restore_ts: Vec<usize>,
    pub norm_g: Vec<f32>,
    pub norm_d: Vec<f32>,
    pub norm_c: Vec<f32>,
    pub counters: Counters,
    pub best_t: Option<usize>,
    pub best_t_nl: Option<usize>,
}

impl TrainingHistory {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn append(history: &mut LossHistory, values: &BTreeMap<String, f32>) {
        for (name, value) in values {
            history.entry(name.clone()).or_default().push(*value);
        }
    }

    /// True if the latest value of validation metric `name` is its minimum so far.
    pub fn is_new_val_low(&self, name: &str) -> bool {
        match self.metrics_val.get(name).and_then(|values| values.last()) {
            Some(last) => self.metrics_val[name].iter().all(|value| last <= value),
            None => false,
        }
    }
}

/// Where checkpoints of one run live.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    output_dir: PathBuf,
    name: String,
}

impl CheckpointLayout {
    pub fn new(output_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            name: name.into(),
        }
    }

    pub fn with_model_dir(&self, epoch: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}_with_model", self.name, epoch))
    }

    pub fn no_model_path(&self, epoch: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}_no_model.json", self.name, epoch))
    }

    pub fn best_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_best", self.name))
    }

    pub fn best_nl_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_best_nl", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_json_uses_checkpoint_keys() {
        let mut history = TrainingHistory::default();
        TrainingHistory::append(
            &mut history.g_losses,
            &BTreeMap::from([("G_l2_loss_rel".to_string(), 0.5)]),
        );
        history.counters.t = 3;

        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["G_losses"]["G_l2_loss_rel"][0], 0.5);
        assert_eq!(json["counters"]["t"], 3);
        assert!(json["restore_ts"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("safegan_history_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(HISTORY_FILE);

        let mut history = TrainingHistory::default();
        history.restore_ts.push(7);
        history.best_t = Some(5);
        history.save(&path).unwrap();
        assert_eq!(TrainingHistory::load(&path).unwrap(), history);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_new_low_tracks_minimum() {
        let mut history = TrainingHistory::default();
        assert!(!history.is_new_val_low("ade"));
        history.metrics_val.insert("ade".to_string(), vec![0.8, 0.6]);
        assert!(history.is_new_val_low("ade"));
        history.metrics_val.get_mut("ade").unwrap().push(0.7);
        assert!(!history.is_new_val_low("ade"));
    }

    #[test]
    fn test_layout_names() {
        let layout = CheckpointLayout::new("runs", "zara");
        assert_eq!(layout.with_model_dir(20), PathBuf::from("runs/zara_20_with_model"));
        assert_eq!(layout.no_model_path(20), PathBuf::from("runs/zara_20_no_model.json"));
        assert_eq!(layout.best_nl_dir(), PathBuf::from("runs/zara_best_nl"));
    }
}
