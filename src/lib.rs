pub mod data;
pub mod error;
pub mod geometry;
pub mod models;
pub mod modules;
pub mod scoring;
pub mod train;
pub mod utils;

pub use error::{Error, Result};
