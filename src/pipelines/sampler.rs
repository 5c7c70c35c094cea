//! The denoising loop shared by all the sampling variants.
//!
//! A [`Sampler`] owns a noise predictor and the noise schedule derived from
//! it. Every call to [`Sampler::sample`] is an independent run: it validates
//! its inputs, builds a fresh scheduler state and walks the timesteps from the
//! noisiest to the clean end, calling the predictor once per step (or twice
//! with classifier-free guidance).
use crate::models::{AdapterFeatures, ConditioningAdapter, FusionMode, NoisePredictor};
use crate::schedulers::{NoiseSchedule, SamplerKind, StepOutput};
use crate::{Error, Result};
use std::sync::Arc;
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// Device on which the latents live.
    pub device: Device,
    /// Evaluate the conditional and unconditional branches in a single
    /// forward pass over a doubled batch rather than two calls.
    pub batched_guidance: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { device: Device::cuda_if_available(), batched_guidance: true }
    }
}

/// Keeps the `mask == 1` region of a known latent while sampling the rest.
#[derive(Debug)]
pub struct Inpaint {
    /// The clean latent to preserve.
    pub x0: Tensor,
    /// `[batch|1, channels|1, height, width]` mask, 1 where `x0` is kept.
    pub mask: Tensor,
}

/// Parameters of a single sampling run.
#[derive(Debug, Clone, Copy)]
pub struct SampleParams<'a> {
    /// Number of denoising steps (`S`).
    pub steps: usize,
    pub batch_size: i64,
    /// Latent shape without the batch dimension: `[channels, height, width]`.
    pub shape: &'a [i64],
    pub conditioning: &'a Tensor,
    /// Embedding of the empty or negative prompt, same shape as `conditioning`.
    pub unconditional_conditioning: &'a Tensor,
    /// `0` uses the unconditional branch only, `1` the conditional one only.
    pub guidance_scale: f64,
    /// DDIM stochasticity in `[0, 1]`.
    pub eta: f64,
    /// Starting latent, drawn from a standard normal when absent.
    pub x_t: Option<&'a Tensor>,
    /// Adapter features, computed once for the whole run.
    pub features: Option<&'a AdapterFeatures>,
    /// Conditioning mode, see [`FusionMode`].
    pub mode: &'a str,
    /// Scale applied to the adapter features.
    pub adapter_weight: f64,
    /// Fraction of the steps, starting from the noisiest, that receive the
    /// adapter features.
    pub cond_tau: f64,
    /// Seed for the initial noise.
    pub seed: Option<i64>,
    /// Intermediates are recorded every `log_every_t` steps and at the end.
    pub log_every_t: usize,
    pub inpaint: Option<&'a Inpaint>,
}

impl<'a> SampleParams<'a> {
    pub fn new(
        steps: usize,
        shape: &'a [i64],
        conditioning: &'a Tensor,
        unconditional_conditioning: &'a Tensor,
    ) -> Self {
        Self {
            steps,
            batch_size: 1,
            shape,
            conditioning,
            unconditional_conditioning,
            guidance_scale: 7.5,
            eta: 0.,
            x_t: None,
            features: None,
            mode: "sketch",
            adapter_weight: 1.,
            cond_tau: 1.,
            seed: None,
            log_every_t: 100,
            inpaint: None,
        }
    }
}

/// Snapshots taken along the trajectory.
#[derive(Debug, Default)]
pub struct Intermediates {
    pub x_inter: Vec<Tensor>,
    pub pred_x0: Vec<Tensor>,
}

#[derive(Debug)]
pub struct SampleOutput {
    pub latent: Tensor,
    pub intermediates: Intermediates,
}

/// What a per-step callback gets to observe.
pub struct StepProgress<'a> {
    pub step_index: usize,
    pub steps: usize,
    pub timestep: usize,
    pub latent: &'a Tensor,
    pub pred_original_sample: &'a Tensor,
}

#[derive(Debug, Clone, Copy)]
enum Guidance {
    Unconditional,
    Conditional,
    ClassifierFree(f64),
}

impl Guidance {
    fn new(scale: f64) -> Self {
        if scale == 0. {
            Self::Unconditional
        } else if scale == 1. {
            Self::Conditional
        } else {
            Self::ClassifierFree(scale)
        }
    }
}

/// Conditioning tensors prepared once per run.
struct Context {
    cond: Tensor,
    uncond: Tensor,
    /// `[uncond; cond]` for the batched guidance forward.
    both: Option<Tensor>,
}

/// Repeats a batch-1 tensor to `batch_size`, other batch sizes must match.
fn expand_batch(xs: &Tensor, batch_size: i64, what: &str) -> Result<Tensor> {
    let size = xs.size();
    match size.first() {
        Some(&b) if b == batch_size => Ok(xs.shallow_clone()),
        Some(1) => {
            let mut repeats = vec![1; size.len()];
            repeats[0] = batch_size;
            Ok(xs.repeat(repeats.as_slice()))
        }
        _ => {
            let mut expected = size.clone();
            if let Some(b) = expected.first_mut() {
                *b = batch_size;
            }
            Err(Error::shape(what, &expected, &size))
        }
    }
}

pub struct Sampler<P> {
    predictor: P,
    kind: SamplerKind,
    schedule: Arc<NoiseSchedule>,
    config: SamplerConfig,
}

impl<P: NoisePredictor> Sampler<P> {
    pub fn new(predictor: P, kind: SamplerKind) -> Result<Self> {
        Self::with_config(predictor, kind, SamplerConfig::default())
    }

    pub fn with_config(predictor: P, kind: SamplerKind, config: SamplerConfig) -> Result<Self> {
        let schedule = Arc::new(NoiseSchedule::new(predictor.schedule_config())?);
        Ok(Self { predictor, kind, schedule, config })
    }

    pub fn kind(&self) -> &SamplerKind {
        &self.kind
    }

    pub fn schedule(&self) -> &Arc<NoiseSchedule> {
        &self.schedule
    }

    pub fn max_steps(&self) -> usize {
        self.schedule.max_steps()
    }

    /// Extracts the adapter features from `structural_input` once and samples
    /// with them.
    pub fn sample_with_adapter<A: ConditioningAdapter + ?Sized>(
        &self,
        adapter: &A,
        structural_input: &Tensor,
        params: &SampleParams,
    ) -> Result<SampleOutput> {
        let features = adapter.extract(structural_input)?;
        let params = SampleParams { features: Some(&features), ..*params };
        self.sample(&params)
    }

    pub fn sample(&self, params: &SampleParams) -> Result<SampleOutput> {
        self.sample_with_callback(params, |_| {})
    }

    /// Runs the full trajectory, `callback` is invoked after every step.
    pub fn sample_with_callback<F: FnMut(&StepProgress)>(
        &self,
        params: &SampleParams,
        mut callback: F,
    ) -> Result<SampleOutput> {
        let steps = params.steps;
        if steps == 0 || steps > self.max_steps() {
            return Err(Error::config(format!(
                "the number of steps must be between 1 and {}, got {steps}",
                self.max_steps()
            )));
        }
        let latent_shape = self.latent_shape(params)?;
        let (batch_size, device) = (params.batch_size, self.config.device);
        if !(params.guidance_scale.is_finite() && params.guidance_scale >= 0.) {
            return Err(Error::config(format!(
                "guidance scale must be a non-negative number, got {}",
                params.guidance_scale
            )));
        }
        if !(0. ..=1.).contains(&params.eta) {
            return Err(Error::config(format!("eta must be in [0, 1], got {}", params.eta)));
        }
        if !(params.cond_tau > 0. && params.cond_tau <= 1.) {
            return Err(Error::config(format!("cond_tau must be in (0, 1], got {}", params.cond_tau)));
        }
        if !params.adapter_weight.is_finite() {
            return Err(Error::config("adapter weight must be finite"));
        }
        let mode: FusionMode = params.mode.parse()?;

        let (cond_size, uncond_size) =
            (params.conditioning.size(), params.unconditional_conditioning.size());
        if cond_size != uncond_size {
            return Err(Error::shape("unconditional conditioning", &cond_size, &uncond_size));
        }
        if let Some(features) = params.features {
            let channels = self.predictor.adapter_channels();
            if channels.is_empty() {
                return Err(Error::shape("adapter feature levels", &[0], &[features.len() as i64]));
            }
            features.validate(&channels, batch_size, (latent_shape[2], latent_shape[3]))?;
        }
        if let Some(x_t) = params.x_t {
            if x_t.size() != latent_shape {
                return Err(Error::shape("initial latent", &latent_shape, &x_t.size()));
            }
        }
        let inpaint = match params.inpaint {
            None => None,
            Some(Inpaint { x0, mask }) => {
                if x0.size() != latent_shape {
                    return Err(Error::shape("inpainting latent", &latent_shape, &x0.size()));
                }
                let size = mask.size();
                let broadcasts = size.len() == 4
                    && (size[0] == 1 || size[0] == latent_shape[0])
                    && (size[1] == 1 || size[1] == latent_shape[1])
                    && size[2..] == latent_shape[2..];
                if !broadcasts {
                    return Err(Error::shape("inpainting mask", &latent_shape, &size));
                }
                Some((
                    x0.to_device(device).to_kind(Kind::Float),
                    mask.to_device(device).to_kind(Kind::Float),
                ))
            }
        };

        let guidance = Guidance::new(params.guidance_scale);
        let batched = matches!(guidance, Guidance::ClassifierFree(_)) && self.config.batched_guidance;
        let context = self.context(params, batched)?;
        let features = params
            .features
            .map(|f| f.prepare(mode, params.adapter_weight, batch_size, 1 + batched as i64, device));
        let adapter_steps = (params.cond_tau * steps as f64).ceil() as usize;

        let mut scheduler = self.kind.build(self.schedule.clone(), steps, params.eta)?;
        let timesteps = scheduler.timesteps().to_vec();

        let mut latents = match params.x_t {
            Some(x_t) => x_t.to_device(device).to_kind(Kind::Float),
            None => {
                if let Some(seed) = params.seed {
                    tch::manual_seed(seed);
                }
                // scale the initial noise by the standard deviation required by the scheduler
                Tensor::randn(latent_shape.as_slice(), (Kind::Float, device))
                    * scheduler.init_noise_sigma()
            }
        };

        tracing::info!(
            sampler = self.kind.name(),
            steps,
            shape = ?latent_shape,
            guidance_scale = params.guidance_scale,
            eta = params.eta,
            "sampling"
        );
        let mut intermediates = Intermediates::default();
        let log_every_t = params.log_every_t.max(1);
        for (step_index, &timestep) in timesteps.iter().enumerate() {
            if let Some((x0, mask)) = &inpaint {
                let noised = self.schedule.add_noise(x0, Tensor::randn_like(x0), timestep);
                latents = noised * mask + (1. - mask) * &latents;
            }
            let features = if step_index < adapter_steps { features.as_ref() } else { None };
            let noise_pred =
                self.predict_noise(&latents, timestep, guidance, batched, &context, features)?;

            let StepOutput { prev_sample, pred_original_sample } =
                scheduler.step(&noise_pred, step_index, &latents);
            latents = prev_sample;
            tracing::debug!(step_index, timestep, "denoising step");

            if step_index % log_every_t == 0 || step_index == steps - 1 {
                intermediates.x_inter.push(latents.shallow_clone());
                intermediates.pred_x0.push(pred_original_sample.shallow_clone());
            }
            callback(&StepProgress {
                step_index,
                steps,
                timestep,
                latent: &latents,
                pred_original_sample: &pred_original_sample,
            });
        }

        Ok(SampleOutput { latent: latents, intermediates })
    }

    fn latent_shape(&self, params: &SampleParams) -> Result<Vec<i64>> {
        if params.shape.len() != 3 {
            return Err(Error::shape("latent shape rank", &[3], &[params.shape.len() as i64]));
        }
        if params.batch_size < 1 || params.shape.iter().any(|&d| d < 1) {
            return Err(Error::config(format!(
                "invalid latent shape {:?} with batch size {}",
                params.shape, params.batch_size
            )));
        }
        Ok([&[params.batch_size], params.shape].concat())
    }

    fn context(&self, params: &SampleParams, batched: bool) -> Result<Context> {
        let device = self.config.device;
        let cond = expand_batch(params.conditioning, params.batch_size, "conditioning")?
            .to_device(device);
        let uncond =
            expand_batch(params.unconditional_conditioning, params.batch_size, "conditioning")?
                .to_device(device);
        let both = if batched { Some(Tensor::cat(&[&uncond, &cond], 0)) } else { None };
        Ok(Context { cond, uncond, both })
    }

    fn call_predictor(
        &self,
        latents: &Tensor,
        timestep: usize,
        context: &Tensor,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        let noise_pred = self.predictor.predict(latents, timestep as f64, context, features)?;
        if noise_pred.size() != latents.size() {
            return Err(Error::shape("noise prediction", &latents.size(), &noise_pred.size()));
        }
        Ok(noise_pred)
    }

    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        guidance: Guidance,
        batched: bool,
        context: &Context,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        let guidance_scale = match guidance {
            Guidance::Unconditional => {
                return self.call_predictor(latents, timestep, &context.uncond, features)
            }
            Guidance::Conditional => {
                return self.call_predictor(latents, timestep, &context.cond, features)
            }
            Guidance::ClassifierFree(scale) => scale,
        };
        let (noise_pred_uncond, noise_pred_text) = match (&context.both, batched) {
            (Some(both), true) => {
                let latent_model_input = Tensor::cat(&[latents, latents], 0);
                let noise_pred =
                    self.call_predictor(&latent_model_input, timestep, both, features)?;
                let noise_pred = noise_pred.chunk(2, 0);
                (noise_pred[0].shallow_clone(), noise_pred[1].shallow_clone())
            }
            _ => (
                self.call_predictor(latents, timestep, &context.uncond, features)?,
                self.call_predictor(latents, timestep, &context.cond, features)?,
            ),
        };
        Ok(&noise_pred_uncond + (noise_pred_text - &noise_pred_uncond) * guidance_scale)
    }
}
