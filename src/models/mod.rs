pub mod critic;
pub mod decoder;
pub mod discriminator;
pub mod encoder;
pub mod generator;
pub mod pooling;
