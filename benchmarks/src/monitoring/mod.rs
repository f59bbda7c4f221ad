//! Resource monitoring for benchmark runs

pub mod sampler;

pub use sampler::{ResourceSampler, ResourceUsage};
