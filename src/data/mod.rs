pub mod batchitem;
pub mod scene_sample;
