//! # Multistep DPM-Solver
//!
//! A fast dedicated high-order solver for the diffusion ODE. The solver works
//! in log-SNR space (`lambda = log(alpha / sigma)`) and keeps the converted
//! model outputs of the previous steps to build second and third order
//! updates.
//!
//! DPM-Solver: https://arxiv.org/abs/2206.00927
//! DPM-Solver++: https://arxiv.org/abs/2211.01095
use super::{prev_timestep, NoiseSchedule, PredictionType, Scheduler, StepOutput, MIN_DENOMINATOR};
use crate::{Error, Result};
use std::sync::Arc;
use tch::Tensor;

/// The algorithm type for the solver.
///
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum DPMSolverAlgorithmType {
    /// Implements the algorithms defined in <https://arxiv.org/abs/2211.01095>.
    #[default]
    DPMSolverPlusPlus,
    /// Implements the algorithms defined in <https://arxiv.org/abs/2206.00927>.
    DPMSolver,
}

/// The solver type for the second-order solver.
/// The solver type slightly affects the sample quality, especially for
/// small number of steps.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum DPMSolverType {
    #[default]
    Midpoint,
    Heun,
}

#[derive(Debug, Clone)]
pub struct DPMSolverSchedulerConfig {
    /// the order of DPM-Solver; can be `1` or `2` or `3`. We recommend to use `solver_order=2` for guided
    /// sampling, and `solver_order=3` for unconditional sampling.
    pub solver_order: usize,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
    /// whether to use the "dynamic thresholding" method (introduced by Imagen, https://arxiv.org/abs/2205.11487).
    /// Note that the thresholding method is unsuitable for latent-space diffusion models.
    pub thresholding: bool,
    /// the ratio for the dynamic thresholding method. Default is `0.995`, the same as Imagen
    /// (https://arxiv.org/abs/2205.11487).
    pub dynamic_thresholding_ratio: f64,
    /// The threshold value for dynamic thresholding. Valid only when `thresholding: true` and
    /// `algorithm_type: DPMSolverAlgorithmType::DPMSolverPlusPlus`.
    pub sample_max_value: f64,
    /// The algorithm type for the solver
    pub algorithm_type: DPMSolverAlgorithmType,
    /// The solver type for the second-order solver.
    pub solver_type: DPMSolverType,
    /// Whether to use lower-order solvers in the final steps. Only valid for < 15 inference steps. We empirically
    /// find this can stabilize the sampling of DPM-Solver for `steps < 15`, especially for steps <= 10.
    pub lower_order_final: bool,
}

impl Default for DPMSolverSchedulerConfig {
    fn default() -> Self {
        Self {
            solver_order: 2,
            prediction_type: PredictionType::Epsilon,
            thresholding: false,
            dynamic_thresholding_ratio: 0.995,
            sample_max_value: 1.0,
            algorithm_type: DPMSolverAlgorithmType::DPMSolverPlusPlus,
            solver_type: DPMSolverType::Midpoint,
            lower_order_final: true,
        }
    }
}

pub struct DPMSolverScheduler {
    alpha_t: Vec<f64>,
    sigma_t: Vec<f64>,
    lambda_t: Vec<f64>,
    lower_order_nums: usize,
    model_outputs: Vec<Tensor>,
    timesteps: Vec<usize>,
    pub config: DPMSolverSchedulerConfig,
}

impl DPMSolverScheduler {
    pub fn new(
        schedule: Arc<NoiseSchedule>,
        inference_steps: usize,
        config: DPMSolverSchedulerConfig,
    ) -> Result<Self> {
        if !(1..=3).contains(&config.solver_order) {
            return Err(Error::config(format!(
                "dpm-solver order must be 1, 2 or 3, got {}",
                config.solver_order
            )));
        }
        let timesteps = schedule.timesteps(inference_steps)?;
        let alphas_cumprod = schedule.alphas_cumprod();
        let alpha_t: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sigma_t: Vec<f64> = alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        let lambda_t = alpha_t.iter().zip(sigma_t.iter()).map(|(a, s)| a.ln() - s.ln()).collect();

        Ok(Self {
            alpha_t,
            sigma_t,
            lambda_t,
            lower_order_nums: 0,
            model_outputs: Vec::with_capacity(config.solver_order),
            timesteps,
            config,
        })
    }

    /// Convert the model output to the corresponding type that the algorithm (DPM-Solver / DPM-Solver++) needs.
    ///
    /// DPM-Solver is designed to discretize an integral of the noise prediction model, and DPM-Solver++ is designed to
    /// discretize an integral of the data prediction model. So we need to first convert the model output to the
    /// corresponding type to match the algorithm.
    fn convert_model_output(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Tensor {
        let (alpha_t, sigma_t) = (self.alpha_t[timestep], self.sigma_t[timestep]);
        match self.config.algorithm_type {
            DPMSolverAlgorithmType::DPMSolverPlusPlus => {
                let x0_pred = match self.config.prediction_type {
                    PredictionType::Epsilon => (sample - sigma_t * model_output) / alpha_t,
                    PredictionType::Sample => model_output.shallow_clone(),
                    PredictionType::VPrediction => alpha_t * sample - sigma_t * model_output,
                };
                if self.config.thresholding {
                    self.threshold(x0_pred)
                } else {
                    x0_pred
                }
            }
            DPMSolverAlgorithmType::DPMSolver => match self.config.prediction_type {
                PredictionType::Epsilon => model_output.shallow_clone(),
                PredictionType::Sample => {
                    (sample - alpha_t * model_output) / sigma_t.max(MIN_DENOMINATOR)
                }
                PredictionType::VPrediction => alpha_t * model_output + sigma_t * sample,
            },
        }
    }

    /// Dynamic thresholding in https://arxiv.org/abs/2205.11487
    fn threshold(&self, x0_pred: Tensor) -> Tensor {
        let dynamic_max_val = x0_pred.abs().reshape([x0_pred.size()[0], -1]).quantile_scalar(
            self.config.dynamic_thresholding_ratio,
            1,
            false,
            // default in torch.quantile
            "linear",
        );
        // broadcast the per-sample threshold over the remaining dimensions
        let shape = [dynamic_max_val.size(), vec![1; x0_pred.dim() - 1]].concat();
        let dynamic_max_val =
            dynamic_max_val.clamp_min(self.config.sample_max_value).view(shape.as_slice());
        x0_pred.clamp_tensor(
            Some(-dynamic_max_val.shallow_clone()),
            Some(dynamic_max_val.shallow_clone()),
        ) / dynamic_max_val
    }

    /// The data prediction for a converted model output.
    fn data_prediction(&self, converted: &Tensor, timestep: usize, sample: &Tensor) -> Tensor {
        match self.config.algorithm_type {
            DPMSolverAlgorithmType::DPMSolverPlusPlus => converted.shallow_clone(),
            DPMSolverAlgorithmType::DPMSolver => {
                let (alpha_s, sigma_s) = (self.alpha_t[timestep], self.sigma_t[timestep]);
                (sample - sigma_s * converted) / alpha_s
            }
        }
    }

    ///  One step for the first-order DPM-Solver (equivalent to DDIM).
    ///  See https://arxiv.org/abs/2206.00927 for the detailed derivation.
    fn dpm_solver_first_order_update(
        &self,
        model_output: &Tensor,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Tensor {
        let (lambda_t, lambda_s) = (self.lambda_t[prev_timestep], self.lambda_t[timestep]);
        let (alpha_t, alpha_s) = (self.alpha_t[prev_timestep], self.alpha_t[timestep]);
        let (sigma_t, sigma_s) = (self.sigma_t[prev_timestep], self.sigma_t[timestep]);
        let h = lambda_t - lambda_s;
        match self.config.algorithm_type {
            DPMSolverAlgorithmType::DPMSolverPlusPlus => {
                (sigma_t / sigma_s) * sample - (alpha_t * ((-h).exp() - 1.0)) * model_output
            }
            DPMSolverAlgorithmType::DPMSolver => {
                (alpha_t / alpha_s) * sample - (sigma_t * (h.exp() - 1.0)) * model_output
            }
        }
    }

    ///  One step for the second-order multistep DPM-Solver.
    fn multistep_dpm_solver_second_order_update(
        &self,
        timestep_list: [usize; 2],
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Tensor {
        let n = self.model_outputs.len();
        let (t, s0, s1) = (prev_timestep, timestep_list[1], timestep_list[0]);
        let (m0, m1) = (&self.model_outputs[n - 1], &self.model_outputs[n - 2]);
        let (lambda_t, lambda_s0, lambda_s1) =
            (self.lambda_t[t], self.lambda_t[s0], self.lambda_t[s1]);
        let (alpha_t, alpha_s0) = (self.alpha_t[t], self.alpha_t[s0]);
        let (sigma_t, sigma_s0) = (self.sigma_t[t], self.sigma_t[s0]);
        let (h, h_0) = (lambda_t - lambda_s0, lambda_s0 - lambda_s1);
        let r0 = h_0 / h;
        let (d0, d1) = (m0, (1.0 / r0) * (m0 - m1));
        match self.config.algorithm_type {
            DPMSolverAlgorithmType::DPMSolverPlusPlus => match self.config.solver_type {
                // See https://arxiv.org/abs/2211.01095 for detailed derivations
                DPMSolverType::Midpoint => {
                    (sigma_t / sigma_s0) * sample
                        - (alpha_t * ((-h).exp() - 1.0)) * d0
                        - 0.5 * (alpha_t * ((-h).exp() - 1.0)) * d1
                }
                DPMSolverType::Heun => {
                    (sigma_t / sigma_s0) * sample - (alpha_t * ((-h).exp() - 1.0)) * d0
                        + (alpha_t * (((-h).exp() - 1.0) / h + 1.0)) * d1
                }
            },
            DPMSolverAlgorithmType::DPMSolver => match self.config.solver_type {
                // See https://arxiv.org/abs/2206.00927 for detailed derivations
                DPMSolverType::Midpoint => {
                    (alpha_t / alpha_s0) * sample
                        - (sigma_t * (h.exp() - 1.0)) * d0
                        - 0.5 * (sigma_t * (h.exp() - 1.0)) * d1
                }
                DPMSolverType::Heun => {
                    (alpha_t / alpha_s0) * sample
                        - (sigma_t * (h.exp() - 1.0)) * d0
                        - (sigma_t * ((h.exp() - 1.0) / h - 1.0)) * d1
                }
            },
        }
    }

    /// One step for the third-order multistep DPM-Solver
    fn multistep_dpm_solver_third_order_update(
        &self,
        timestep_list: [usize; 3],
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Tensor {
        let n = self.model_outputs.len();
        let (t, s0, s1, s2) = (prev_timestep, timestep_list[2], timestep_list[1], timestep_list[0]);
        let (m0, m1, m2) =
            (&self.model_outputs[n - 1], &self.model_outputs[n - 2], &self.model_outputs[n - 3]);
        let (lambda_t, lambda_s0, lambda_s1, lambda_s2) =
            (self.lambda_t[t], self.lambda_t[s0], self.lambda_t[s1], self.lambda_t[s2]);
        let (alpha_t, alpha_s0) = (self.alpha_t[t], self.alpha_t[s0]);
        let (sigma_t, sigma_s0) = (self.sigma_t[t], self.sigma_t[s0]);
        let (h, h_0, h_1) = (lambda_t - lambda_s0, lambda_s0 - lambda_s1, lambda_s1 - lambda_s2);
        let (r0, r1) = (h_0 / h, h_1 / h);
        let d0 = m0;
        let (d1_0, d1_1) = ((1.0 / r0) * (m0 - m1), (1.0 / r1) * (m1 - m2));
        let d1 = &d1_0 + (r0 / (r0 + r1)) * (&d1_0 - &d1_1);
        let d2 = (1.0 / (r0 + r1)) * (d1_0 - d1_1);

        match self.config.algorithm_type {
            DPMSolverAlgorithmType::DPMSolverPlusPlus => {
                (sigma_t / sigma_s0) * sample - (alpha_t * ((-h).exp() - 1.0)) * d0
                    + (alpha_t * (((-h).exp() - 1.0) / h + 1.0)) * d1
                    - (alpha_t * (((-h).exp() - 1.0 + h) / h.powi(2) - 0.5)) * d2
            }
            DPMSolverAlgorithmType::DPMSolver => {
                (alpha_t / alpha_s0) * sample
                    - (sigma_t * (h.exp() - 1.0)) * d0
                    - (sigma_t * ((h.exp() - 1.0) / h - 1.0)) * d1
                    - (sigma_t * ((h.exp() - 1.0 - h) / h.powi(2) - 0.5)) * d2
            }
        }
    }
}

impl Scheduler for DPMSolverScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> StepOutput {
        let timestep = self.timesteps[step_index];
        let n_steps = self.timesteps.len();
        let lower_order_final =
            (step_index == n_steps - 1) && self.config.lower_order_final && n_steps < 15;
        let lower_order_second =
            (step_index == n_steps - 2) && self.config.lower_order_final && n_steps < 15;

        let model_output = self.convert_model_output(model_output, timestep, sample);
        let pred_original_sample = self.data_prediction(&model_output, timestep, sample);
        if self.model_outputs.len() == self.config.solver_order {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(model_output.shallow_clone());

        let prev_sample = match prev_timestep(&self.timesteps, step_index) {
            // sigma vanishes at the clean end, every order reduces to the data prediction
            None => pred_original_sample.shallow_clone(),
            Some(prev_timestep) => {
                if self.config.solver_order == 1 || self.lower_order_nums < 1 || lower_order_final
                {
                    self.dpm_solver_first_order_update(
                        &model_output,
                        timestep,
                        prev_timestep,
                        sample,
                    )
                } else if self.config.solver_order == 2
                    || self.lower_order_nums < 2
                    || lower_order_second
                {
                    let timestep_list = [self.timesteps[step_index - 1], timestep];
                    self.multistep_dpm_solver_second_order_update(
                        timestep_list,
                        prev_timestep,
                        sample,
                    )
                } else {
                    let timestep_list =
                        [self.timesteps[step_index - 2], self.timesteps[step_index - 1], timestep];
                    self.multistep_dpm_solver_third_order_update(
                        timestep_list,
                        prev_timestep,
                        sample,
                    )
                }
            }
        };

        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }

        StepOutput { prev_sample, pred_original_sample }
    }
}
