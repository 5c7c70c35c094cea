//! # Pipelines

pub mod sampler;

pub use sampler::{
    Inpaint, Intermediates, SampleOutput, SampleParams, Sampler, SamplerConfig, StepProgress,
};

use tch::{Device, Kind, Tensor};

/// Converts decoded images with values in `[-1, 1]` to 8-bit pixels on the
/// CPU, clamping anything outside the range.
pub fn postprocess(image: &Tensor) -> Tensor {
    let image = (image / 2 + 0.5).clamp(0., 1.).to_device(Device::Cpu);
    (image * 255.).to_kind(Kind::Uint8)
}

/// Binarises an edge or sketch map, 1 where `edges > threshold`.
pub fn binarize(edges: &Tensor, threshold: f64) -> Tensor {
    edges.gt(threshold).to_kind(Kind::Float)
}
