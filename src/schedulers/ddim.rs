//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) is a simple scheduler
//! similar to Denoising Diffusion Probabilistic Models (DDPM). The DDPM
//! generative process is the reverse of a Markovian process, DDIM generalizes
//! this to non-Markovian guidance.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::{
    prev_timestep, NoiseSchedule, PredictionType, Scheduler, StepOutput, MIN_DENOMINATOR,
};
use crate::Result;
use std::sync::Arc;
use tch::Tensor;

/// The configuration for the DDIM scheduler.
#[derive(Debug, Clone, Copy)]
pub struct DDIMSchedulerConfig {
    /// The amount of noise to be added at each step, `0` gives a deterministic
    /// trajectory and `1` a fully ancestral one. Overridden by the run's
    /// eta when built through [`super::SamplerKind`].
    pub eta: f64,
    /// prediction type of the scheduler function, one of `epsilon` (predicting
    /// the noise of the diffusion process), `sample` (directly predicting the noisy sample`)
    /// or `v_prediction` (see section 2.4 https://imagen.research.google/video/paper.pdf)
    pub prediction_type: PredictionType,
}

impl Default for DDIMSchedulerConfig {
    fn default() -> Self {
        Self { eta: 0., prediction_type: PredictionType::Epsilon }
    }
}

/// The DDIM scheduler.
#[derive(Debug, Clone)]
pub struct DDIMScheduler {
    schedule: Arc<NoiseSchedule>,
    timesteps: Vec<usize>,
    pub config: DDIMSchedulerConfig,
}

impl DDIMScheduler {
    /// Creates a new DDIM scheduler running `inference_steps` steps over the
    /// given training schedule.
    pub fn new(
        schedule: Arc<NoiseSchedule>,
        inference_steps: usize,
        config: DDIMSchedulerConfig,
    ) -> Result<Self> {
        let timesteps = schedule.timesteps(inference_steps)?;
        Ok(Self { schedule, timesteps, config })
    }
}

/// Splits a model output into the predicted clean sample and the predicted
/// noise at a timestep whose alpha product is `alpha_prod_t`.
pub(crate) fn split_model_output(
    prediction_type: PredictionType,
    model_output: &Tensor,
    alpha_prod_t: f64,
    sample: &Tensor,
) -> (Tensor, Tensor) {
    let beta_prod_t = 1. - alpha_prod_t;
    match prediction_type {
        PredictionType::Epsilon => {
            let pred_original_sample = (sample - beta_prod_t.sqrt() * model_output)
                / alpha_prod_t.max(MIN_DENOMINATOR).sqrt();
            (pred_original_sample, model_output.shallow_clone())
        }
        PredictionType::VPrediction => {
            let pred_original_sample =
                alpha_prod_t.sqrt() * sample - beta_prod_t.sqrt() * model_output;
            let pred_epsilon = alpha_prod_t.sqrt() * model_output + beta_prod_t.sqrt() * sample;
            (pred_original_sample, pred_epsilon)
        }
        PredictionType::Sample => {
            let pred_original_sample = model_output.shallow_clone();
            let pred_epsilon = (sample - alpha_prod_t.sqrt() * &pred_original_sample)
                / beta_prod_t.max(MIN_DENOMINATOR).sqrt();
            (pred_original_sample, pred_epsilon)
        }
    }
}

impl Scheduler for DDIMScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> StepOutput {
        let timestep = self.timesteps[step_index];
        let prev_timestep = prev_timestep(&self.timesteps, step_index);

        let alpha_prod_t = self.schedule.alpha_cumprod(Some(timestep));
        let alpha_prod_t_prev = self.schedule.alpha_cumprod(prev_timestep);
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) =
            split_model_output(self.config.prediction_type, model_output, alpha_prod_t, sample);

        let variance = (beta_prod_t_prev / beta_prod_t.max(MIN_DENOMINATOR))
            * (1. - alpha_prod_t / alpha_prod_t_prev.max(MIN_DENOMINATOR));
        let std_dev_t = self.config.eta * variance.max(0.).sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.).sqrt() * pred_epsilon;
        let prev_sample = alpha_prod_t_prev.sqrt() * &pred_original_sample + pred_sample_direction;
        let prev_sample = if self.config.eta > 0. && std_dev_t > 0. {
            &prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t
        } else {
            prev_sample
        };
        StepOutput { prev_sample, pred_original_sample }
    }
}
