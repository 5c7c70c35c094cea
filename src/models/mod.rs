//! # Models
//!
//! The networks used around a diffusion loop. The sampler only sees them
//! through the traits below, `jit` provides TorchScript backed versions.
use crate::schedulers::NoiseScheduleConfig;
use crate::Result;
use tch::Tensor;

pub mod adapter;
pub mod jit;

pub use adapter::{AdapterFeatures, FusionMode};

/// The denoising backbone: predicts the noise (or the configured target)
/// contained in a noisy latent.
pub trait NoisePredictor {
    /// `latent` is `[batch, channels, height, width]`, `conditioning` has the
    /// same batch size. The result has the shape of `latent`.
    fn predict(
        &self,
        latent: &Tensor,
        timestep: f64,
        conditioning: &Tensor,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor>;

    /// Channel count expected for each adapter feature level, from the finest
    /// resolution to the coarsest. Empty when the model takes no adapter.
    fn adapter_channels(&self) -> Vec<i64> {
        vec![]
    }

    /// The noise schedule the model was trained with.
    fn schedule_config(&self) -> NoiseScheduleConfig {
        NoiseScheduleConfig::default()
    }
}

impl<P: NoisePredictor + ?Sized> NoisePredictor for &P {
    fn predict(
        &self,
        latent: &Tensor,
        timestep: f64,
        conditioning: &Tensor,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        (**self).predict(latent, timestep, conditioning, features)
    }

    fn adapter_channels(&self) -> Vec<i64> {
        (**self).adapter_channels()
    }

    fn schedule_config(&self) -> NoiseScheduleConfig {
        (**self).schedule_config()
    }
}

/// Turns a structural input (sketch, edge map) into multi-scale features.
pub trait ConditioningAdapter {
    fn extract(&self, structural_input: &Tensor) -> Result<AdapterFeatures>;
}

/// Maps a latent back to pixel space, values in `[-1, 1]`.
pub trait Decoder {
    fn decode(&self, latent: &Tensor) -> Result<Tensor>;
}

/// Embeds a prompt, `[1, tokens, dim]`.
pub trait TextEncoder {
    fn encode(&self, prompt: &str) -> Result<Tensor>;
}

/// Computes an edge probability map `[batch, 1, height, width]` from an RGB
/// image with values in `[0, 1]`.
pub trait EdgeDetector {
    fn detect(&self, image: &Tensor) -> Result<Tensor>;
}
