pub mod checkpoint;
pub mod config;
pub mod evaluate;
pub mod schedule;
pub mod steps;
pub mod trainer;

pub use config::TrainingConfig;
pub use trainer::{gan_trainer, GanTrainer};
