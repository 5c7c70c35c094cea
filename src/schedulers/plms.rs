//! # Pseudo Linear Multi-Step
//!
//! Pseudo numerical methods for diffusion models (PNDM) proposes using more
//! advanced ODE integration techniques. The PLMS variant combines the noise
//! estimates of the last few steps with a linear multi-step method and then
//! transfers the sample with the deterministic DDIM formula.
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778
use super::{
    prev_timestep, NoiseSchedule, PredictionType, Scheduler, StepOutput, MIN_DENOMINATOR,
};
use crate::{Error, Result};
use std::sync::Arc;
use tch::Tensor;

/// Number of past noise estimates used by the fourth order update.
const HISTORY: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct PLMSSchedulerConfig {
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
}

impl Default for PLMSSchedulerConfig {
    fn default() -> Self {
        Self { prediction_type: PredictionType::Epsilon }
    }
}

pub struct PLMSScheduler {
    schedule: Arc<NoiseSchedule>,
    timesteps: Vec<usize>,
    ets: Vec<Tensor>,
    pub config: PLMSSchedulerConfig,
}

impl PLMSScheduler {
    pub fn new(
        schedule: Arc<NoiseSchedule>,
        inference_steps: usize,
        config: PLMSSchedulerConfig,
    ) -> Result<Self> {
        if config.prediction_type == PredictionType::Sample {
            return Err(Error::config("plms supports epsilon and v_prediction models only"));
        }
        let timesteps = schedule.timesteps(inference_steps)?;
        Ok(Self { schedule, timesteps, ets: Vec::with_capacity(HISTORY), config })
    }

    /// Number of past noise estimates currently held.
    pub fn history_len(&self) -> usize {
        self.ets.len()
    }

    /// Combines the current noise estimate with the history. An empty history
    /// falls back to the first order (DDIM) update, a partial one to the
    /// Adams-Bashforth formula of matching order.
    fn multistep_epsilon(&self, e_t: &Tensor) -> Tensor {
        let n_ets = self.ets.len();
        match n_ets {
            0 => e_t.shallow_clone(),
            1 => (3. * e_t - &self.ets[0]) / 2.,
            2 => (23. * e_t - 16. * &self.ets[1] + 5. * &self.ets[0]) / 12.,
            _ => {
                (55. * e_t - 59. * &self.ets[n_ets - 1] + 37. * &self.ets[n_ets - 2]
                    - 9. * &self.ets[n_ets - 3])
                    / 24.
            }
        }
    }

    fn get_prev_sample(
        &self,
        sample: &Tensor,
        alpha_prod_t: f64,
        alpha_prod_t_prev: f64,
        model_output: &Tensor,
    ) -> Tensor {
        //  See formula (9) of PNDM paper https://arxiv.org/pdf/2202.09778.pdf
        //  this function computes x_(t−δ) using the formula of (9)
        //  Note that x_t needs to be added to both sides of the equation
        //
        //  Notation (<variable name> -> <name in paper>
        //  alpha_prod_t -> α_t
        //  alpha_prod_t_prev -> α_(t−δ)
        //  beta_prod_t -> (1 - α_t)
        //  beta_prod_t_prev -> (1 - α_(t−δ))
        //  sample -> x_t
        //  model_output -> e_θ(x_t, t)
        //  prev_sample -> x_(t−δ)
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        // corresponds to (α_(t−δ) - α_t) divided by
        // denominator of x_t in formula (9) and plus 1
        // Note: (α_(t−δ) - α_t) / (sqrt(α_t) * (sqrt(α_(t−δ)) + sqr(α_t))) =
        // sqrt(α_(t−δ)) / sqrt(α_t))
        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t.max(MIN_DENOMINATOR)).sqrt();

        // corresponds to denominator of e_θ(x_t, t) in formula (9)
        let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        sample_coeff * sample
            - (alpha_prod_t_prev - alpha_prod_t) * model_output
                / model_output_denom_coeff.max(MIN_DENOMINATOR)
    }
}

impl Scheduler for PLMSScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> StepOutput {
        let timestep = self.timesteps[step_index];
        let alpha_prod_t = self.schedule.alpha_cumprod(Some(timestep));
        let alpha_prod_t_prev =
            self.schedule.alpha_cumprod(prev_timestep(&self.timesteps, step_index));
        let beta_prod_t = 1. - alpha_prod_t;

        let e_t = match self.config.prediction_type {
            PredictionType::VPrediction => {
                alpha_prod_t.sqrt() * model_output + beta_prod_t.sqrt() * sample
            }
            _ => model_output.shallow_clone(),
        };

        let e_prime = self.multistep_epsilon(&e_t);
        let prev_sample = self.get_prev_sample(sample, alpha_prod_t, alpha_prod_t_prev, &e_prime);
        let pred_original_sample =
            (sample - beta_prod_t.sqrt() * &e_prime) / alpha_prod_t.max(MIN_DENOMINATOR).sqrt();

        if self.ets.len() == HISTORY {
            self.ets.remove(0);
        }
        self.ets.push(e_t);

        StepOutput { prev_sample, pred_original_sample }
    }
}
