pub mod alignment;
pub mod commons;
pub mod config;
pub mod decoder;
pub mod discriminator;
pub mod duration;
pub mod encoder;
pub mod flow;
pub mod generator;

pub use config::{DiscriminatorConfig, GeneratorConfig};
pub use discriminator::{DiscriminatorOutput, MultiPeriodDiscriminator};
pub use generator::{GeneratorOutput, InferenceOutput, SynthesizerTrn};
