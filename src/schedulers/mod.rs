//! # Noise schedules and samplers
//!
//! A [`NoiseSchedule`] is computed once from the training configuration and
//! shared between sampling runs. Each run then builds its own [`Scheduler`],
//! the per-variant update rule that owns whatever history the variant needs.
//! The number of sampling steps sets the trade-off between inference speed
//! and quality.
use crate::{Error, Result};
use std::sync::Arc;
use tch::{kind, Kind, Tensor};

pub mod ddim;
pub mod dpmsolver;
pub mod plms;

/// Lower bound used when an alpha or beta product ends up in a denominator.
pub(crate) const MIN_DENOMINATOR: f64 = 1e-12;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// The training-time noise configuration of a denoising model.
#[derive(Debug, Clone, Copy)]
pub struct NoiseScheduleConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// The last step of a trajectory targets this alpha product. When set it
    /// is `1` (a fully denoised sample), otherwise the alpha product at `t = 0`.
    pub set_alpha_to_one: bool,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            set_alpha_to_one: true,
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms it to the cumulative product of `(1-beta)`
/// up to that part of the diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let n = num_diffusion_timesteps as f64;
    let betas: Vec<f64> = (0..num_diffusion_timesteps)
        .map(|i| {
            let (t1, t2) = (i as f64 / n, (i + 1) as f64 / n);
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect();
    Tensor::from_slice(&betas)
}

/// The cumulative alpha products of a diffusion model, one per training
/// timestep, shared read-only between sampling runs.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    pub config: NoiseScheduleConfig,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let n = config.train_timesteps;
        if n == 0 {
            return Err(Error::config("the number of training timesteps must be positive"));
        }
        if config.beta_schedule != BetaSchedule::SquaredcosCapV2
            && !(0. < config.beta_start
                && config.beta_start <= config.beta_end
                && config.beta_end < 1.)
        {
            return Err(Error::config(format!(
                "betas must satisfy 0 < beta_start <= beta_end < 1, got {} and {}",
                config.beta_start, config.beta_end
            )));
        }
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                n as i64,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_start, config.beta_end, n as i64, kind::DOUBLE_CPU)
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
        };
        let alphas: Tensor = 1. - betas;
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double))?;

        let in_range = alphas_cumprod.iter().all(|&a| a > 0. && a < 1.);
        let decreasing = alphas_cumprod.windows(2).all(|w| w[1] < w[0]);
        if !in_range || !decreasing {
            return Err(Error::config(
                "alphas_cumprod must be strictly decreasing within (0, 1)",
            ));
        }

        let final_alpha_cumprod = if config.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };
        Ok(Self { alphas_cumprod, final_alpha_cumprod, config })
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        self.alphas_cumprod.as_slice()
    }

    /// The alpha product at `timestep`, `None` standing for the clean end of
    /// the trajectory.
    pub fn alpha_cumprod(&self, timestep: Option<usize>) -> f64 {
        match timestep {
            Some(t) => self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)],
            None => self.final_alpha_cumprod,
        }
    }

    pub fn final_alpha_cumprod(&self) -> f64 {
        self.final_alpha_cumprod
    }

    pub fn train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// The largest number of sampling steps this schedule supports.
    pub fn max_steps(&self) -> usize {
        self.train_timesteps()
    }

    /// Timesteps visited by a `steps` long trajectory, in decreasing order.
    ///
    /// They are linearly spaced over the whole training range so the first
    /// one is always the noisiest timestep and, as soon as there are two
    /// steps or more, the last one is `0`. The step out of the last timestep
    /// lands on the clean end of the schedule.
    pub fn timesteps(&self, steps: usize) -> Result<Vec<usize>> {
        let t_max = self.train_timesteps() - 1;
        if steps == 0 {
            return Err(Error::config("the number of sampling steps must be positive"));
        }
        if steps > self.max_steps() {
            return Err(Error::config(format!(
                "{steps} sampling steps requested but the schedule supports at most {}",
                self.max_steps()
            )));
        }
        if steps == 1 {
            return Ok(vec![t_max]);
        }
        let stride = t_max as f64 / (steps - 1) as f64;
        let timesteps =
            (0..steps).map(|i| ((i as f64 * stride).round() as usize).min(t_max)).rev().collect();
        Ok(timesteps)
    }

    /// Diffuses a clean sample forward to `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Tensor {
        let alpha_prod = self.alpha_cumprod(Some(timestep));
        alpha_prod.sqrt() * original + (1.0 - alpha_prod).sqrt() * noise
    }
}

/// The result of a single denoising step.
#[derive(Debug)]
pub struct StepOutput {
    /// The sample at the next, less noisy, timestep.
    pub prev_sample: Tensor,
    /// The current estimate of the fully denoised sample.
    pub pred_original_sample: Tensor,
}

/// The update rule of a sampling variant, bound to one sampling run.
pub trait Scheduler {
    fn timesteps(&self) -> &[usize];

    /// Standard deviation of the initial noise.
    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    /// Performs the backward step number `step_index` given the (guided)
    /// model output at `timesteps()[step_index]`.
    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> StepOutput;
}

/// The timestep following `step_index`, `None` once the trajectory reaches
/// its clean end.
pub(crate) fn prev_timestep(timesteps: &[usize], step_index: usize) -> Option<usize> {
    timesteps.get(step_index + 1).copied()
}

/// Selects the sampling algorithm used by a pipeline.
#[derive(Debug, Clone)]
pub enum SamplerKind {
    /// The `eta` of the config is replaced by the one passed to [`Self::build`].
    Ddim(ddim::DDIMSchedulerConfig),
    Plms(plms::PLMSSchedulerConfig),
    DpmSolver(dpmsolver::DPMSolverSchedulerConfig),
}

impl Default for SamplerKind {
    fn default() -> Self {
        Self::ddim()
    }
}

impl SamplerKind {
    pub fn ddim() -> Self {
        Self::Ddim(Default::default())
    }

    pub fn plms() -> Self {
        Self::Plms(Default::default())
    }

    pub fn dpm_solver() -> Self {
        Self::DpmSolver(Default::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ddim(_) => "ddim",
            Self::Plms(_) => "plms",
            Self::DpmSolver(_) => "dpm-solver",
        }
    }

    /// Builds the scheduler state for one `steps` long run over `schedule`.
    pub fn build(
        &self,
        schedule: Arc<NoiseSchedule>,
        steps: usize,
        eta: f64,
    ) -> Result<Box<dyn Scheduler>> {
        match self {
            Self::Ddim(config) => {
                let config = ddim::DDIMSchedulerConfig { eta, ..*config };
                Ok(Box::new(ddim::DDIMScheduler::new(schedule, steps, config)?))
            }
            Self::Plms(config) => {
                if eta != 0. {
                    return Err(Error::config(format!("eta must be 0 for plms, got {eta}")));
                }
                Ok(Box::new(plms::PLMSScheduler::new(schedule, steps, *config)?))
            }
            Self::DpmSolver(config) => {
                if eta != 0. {
                    tracing::warn!(eta, "dpm-solver sampling is deterministic, ignoring eta");
                }
                Ok(Box::new(dpmsolver::DPMSolverScheduler::new(schedule, steps, config.clone())?))
            }
        }
    }
}
