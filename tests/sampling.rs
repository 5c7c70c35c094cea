use std::cell::Cell;
use std::sync::{Mutex, MutexGuard};
use t2i_adapter::models::{AdapterFeatures, ConditioningAdapter, NoisePredictor};
use t2i_adapter::pipelines::{Inpaint, SampleParams, Sampler, SamplerConfig};
use t2i_adapter::schedulers::SamplerKind;
use t2i_adapter::{Error, Result};
use tch::{Device, Kind, Tensor};

const CHANNELS: [i64; 4] = [8, 16, 32, 32];

// Serializes the tests drawing from torch's global generator.
static RNG: Mutex<()> = Mutex::new(());

fn lock_rng() -> MutexGuard<'static, ()> {
    RNG.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A cheap stand-in for the backbone: the prediction depends on the latent,
/// the timestep, the per-sample conditioning and the adapter features.
#[derive(Default)]
struct MockPredictor {
    calls: Cell<usize>,
    calls_with_features: Cell<usize>,
    adapter_channels: Vec<i64>,
}

impl MockPredictor {
    fn with_adapter() -> Self {
        Self { adapter_channels: CHANNELS.to_vec(), ..Default::default() }
    }
}

impl NoisePredictor for MockPredictor {
    fn predict(
        &self,
        latent: &Tensor,
        timestep: f64,
        conditioning: &Tensor,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        self.calls.set(self.calls.get() + 1);
        let batch = latent.size()[0];
        let context: Vec<Tensor> =
            (0..batch).map(|i| conditioning.get(i).mean(Kind::Float)).collect();
        let context = Tensor::stack(&context, 0).view([batch, 1, 1, 1]);
        let mut eps = latent * (0.1 + timestep / 10_000.) + context * 0.05;
        if let Some(features) = features {
            self.calls_with_features.set(self.calls_with_features.get() + 1);
            for level in features.levels() {
                eps += level.mean(Kind::Float) * 0.01;
            }
        }
        Ok(eps)
    }

    fn adapter_channels(&self) -> Vec<i64> {
        self.adapter_channels.clone()
    }
}

#[derive(Default)]
struct MockAdapter {
    calls: Cell<usize>,
}

impl ConditioningAdapter for MockAdapter {
    fn extract(&self, structural_input: &Tensor) -> Result<AdapterFeatures> {
        self.calls.set(self.calls.get() + 1);
        let size = structural_input.size();
        // pixel input, the latent is 8 times smaller
        let (h, w) = (size[2] / 8, size[3] / 8);
        let levels = CHANNELS
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let pooled = structural_input.mean(Kind::Float);
                Tensor::ones([1, c, h >> i, w >> i], (Kind::Float, Device::Cpu)) * pooled
            })
            .collect();
        Ok(AdapterFeatures::new(levels))
    }
}

fn sampler(predictor: &MockPredictor, kind: SamplerKind) -> Sampler<&MockPredictor> {
    let config = SamplerConfig { device: Device::Cpu, ..Default::default() };
    Sampler::with_config(predictor, kind, config).unwrap()
}

fn kinds() -> Vec<SamplerKind> {
    vec![SamplerKind::ddim(), SamplerKind::plms(), SamplerKind::dpm_solver()]
}

/// A reproducible tensor that does not touch the global random generator.
fn fixed(shape: &[i64], phase: f64) -> Tensor {
    let numel: i64 = shape.iter().product();
    (Tensor::arange(numel, (Kind::Float, Device::Cpu)) * 0.37 + phase).sin().view(shape)
}

fn assert_finite(xs: &Tensor) {
    assert_eq!(xs.isfinite().all().int64_value(&[]), 1);
}

#[test]
fn end_to_end_with_guidance() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let shape = [4, 64, 64];
    let cond = fixed(&[1, 77, 32], 0.);
    let uncond = fixed(&[1, 77, 32], 1.);
    let x_t = fixed(&[1, 4, 64, 64], 2.);
    for kind in kinds() {
        let sampler = sampler(&predictor, kind);
        let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(50, &shape, &cond, &uncond) };
        let out = sampler.sample(&params)?;
        assert_eq!(out.latent.size(), vec![1, 4, 64, 64]);
        assert_finite(&out.latent);
    }
    // one batched forward per step
    assert_eq!(predictor.calls.get(), 3 * 50);
    Ok(())
}

#[test]
fn deterministic_without_eta() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let shape = [4, 16, 16];
    let cond = fixed(&[2, 7, 8], 0.);
    let uncond = fixed(&[2, 7, 8], 1.);
    let x_t = fixed(&[2, 4, 16, 16], 2.);
    for kind in kinds() {
        let sampler = sampler(&predictor, kind);
        let params = SampleParams {
            batch_size: 2,
            x_t: Some(&x_t),
            ..SampleParams::new(20, &shape, &cond, &uncond)
        };
        let a = sampler.sample(&params)?.latent;
        let b = sampler.sample(&params)?.latent;
        assert!(a.equal(&b), "{}", sampler.kind().name());
    }
    Ok(())
}

#[test]
fn zero_guidance_ignores_the_conditioning() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 8, 8];
    let uncond = fixed(&[1, 7, 8], 1.);
    let (cond_a, cond_b) = (fixed(&[1, 7, 8], 0.), fixed(&[1, 7, 8], 5.));
    let x_t = fixed(&[1, 4, 8, 8], 2.);
    let run = |cond: &Tensor| {
        let params = SampleParams {
            guidance_scale: 0.,
            x_t: Some(&x_t),
            ..SampleParams::new(10, &shape, cond, &uncond)
        };
        sampler.sample(&params).map(|out| out.latent)
    };
    let (a, b) = (run(&cond_a)?, run(&cond_b)?);
    assert!(a.equal(&b));
    // a single unconditional call per step
    assert_eq!(predictor.calls.get(), 20);

    let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(10, &shape, &cond_a, &uncond) };
    assert!(!sampler.sample(&params)?.latent.equal(&a));
    Ok(())
}

#[test]
fn batched_and_split_guidance_agree() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let uncond = fixed(&[1, 7, 8], 1.);
    let x_t = fixed(&[1, 4, 8, 8], 2.);
    let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(10, &shape, &cond, &uncond) };

    let batched = sampler(&predictor, SamplerKind::ddim()).sample(&params)?.latent;
    let config = SamplerConfig { device: Device::Cpu, batched_guidance: false };
    let split = Sampler::with_config(&predictor, SamplerKind::ddim(), config)?;
    let split = split.sample(&params)?.latent;
    let diff = (batched - split).abs().max().double_value(&[]);
    assert!(diff < 1e-5, "{diff}");
    // 10 batched calls then 20 separate ones
    assert_eq!(predictor.calls.get(), 30);
    Ok(())
}

#[test]
fn too_many_steps_fail_before_any_prediction() {
    let predictor = MockPredictor::default();
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    for kind in kinds() {
        let sampler = sampler(&predictor, kind);
        let too_many = sampler.max_steps() + 1;
        for steps in [0, too_many] {
            let params = SampleParams::new(steps, &shape, &cond, &cond);
            assert!(matches!(sampler.sample(&params), Err(Error::Configuration(_))));
        }
    }
    assert_eq!(predictor.calls.get(), 0);
}

#[test]
fn single_step_trajectories() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let uncond = fixed(&[1, 7, 8], 1.);
    let x_t = fixed(&[1, 4, 8, 8], 2.);
    for kind in kinds() {
        let sampler = sampler(&predictor, kind);
        let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(1, &shape, &cond, &uncond) };
        let out = sampler.sample(&params)?;
        assert_eq!(out.latent.size(), vec![1, 4, 8, 8]);
        assert_finite(&out.latent);
        assert_eq!(out.intermediates.x_inter.len(), 1);
    }
    Ok(())
}

#[test]
fn adapter_features_are_extracted_once() -> anyhow::Result<()> {
    let predictor = MockPredictor::with_adapter();
    let adapter = MockAdapter::default();
    let sampler = sampler(&predictor, SamplerKind::plms());
    let shape = [4, 16, 16];
    let cond = fixed(&[1, 7, 8], 0.);
    let uncond = fixed(&[1, 7, 8], 1.);
    let sketch = fixed(&[1, 1, 128, 128], 3.).gt(0.).to_kind(Kind::Float);
    let x_t = fixed(&[1, 4, 16, 16], 2.);

    let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(25, &shape, &cond, &uncond) };
    let out = sampler.sample_with_adapter(&adapter, &sketch, &params)?;
    assert_finite(&out.latent);
    assert_eq!(adapter.calls.get(), 1);
    assert_eq!(predictor.calls_with_features.get(), 25);

    let without = sampler.sample(&params)?;
    assert!(!without.latent.equal(&out.latent));
    Ok(())
}

#[test]
fn cond_tau_limits_feature_injection() -> anyhow::Result<()> {
    let predictor = MockPredictor::with_adapter();
    let adapter = MockAdapter::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 16, 16];
    let cond = fixed(&[1, 7, 8], 0.);
    let features = adapter.extract(&fixed(&[1, 1, 128, 128], 3.))?;
    let params = SampleParams {
        features: Some(&features),
        cond_tau: 0.5,
        ..SampleParams::new(10, &shape, &cond, &cond)
    };
    sampler.sample(&params)?;
    assert_eq!(predictor.calls.get(), 10);
    assert_eq!(predictor.calls_with_features.get(), 5);
    Ok(())
}

#[test]
fn shape_mismatches_fail_fast() -> anyhow::Result<()> {
    let predictor = MockPredictor::with_adapter();
    let adapter = MockAdapter::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 16, 16];
    let cond = fixed(&[1, 7, 8], 0.);

    let uncond = fixed(&[1, 5, 8], 1.);
    let params = SampleParams::new(10, &shape, &cond, &uncond);
    assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })));

    // features for a 32x32 latent
    let features = adapter.extract(&fixed(&[1, 1, 256, 256], 3.))?;
    let params = SampleParams { features: Some(&features), ..SampleParams::new(10, &shape, &cond, &cond) };
    assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })));

    let x_t = fixed(&[1, 4, 8, 8], 2.);
    let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(10, &shape, &cond, &cond) };
    assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })));

    let cond2 = fixed(&[2, 7, 8], 0.);
    let uncond2 = fixed(&[2, 7, 8], 0.);
    let params = SampleParams { batch_size: 3, ..SampleParams::new(10, &shape, &cond2, &uncond2) };
    assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })));

    // the plain predictor takes no adapter at all
    let plain = MockPredictor::default();
    let plain_sampler = self::sampler(&plain, SamplerKind::ddim());
    let features = adapter.extract(&fixed(&[1, 1, 128, 128], 3.))?;
    let params = SampleParams { features: Some(&features), ..SampleParams::new(10, &shape, &cond, &cond) };
    assert!(matches!(plain_sampler.sample(&params), Err(Error::ShapeMismatch { .. })));

    assert_eq!(predictor.calls.get() + plain.calls.get(), 0);
    Ok(())
}

#[test]
fn invalid_parameters_fail_fast() {
    let predictor = MockPredictor::default();
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let base = SampleParams::new(10, &shape, &cond, &cond);

    let plms = sampler(&predictor, SamplerKind::plms());
    assert!(matches!(plms.sample(&SampleParams { eta: 0.5, ..base }), Err(Error::Configuration(_))));

    let ddim = sampler(&predictor, SamplerKind::ddim());
    for params in [
        SampleParams { mode: "depth", ..base },
        SampleParams { eta: 1.5, ..base },
        SampleParams { guidance_scale: -1., ..base },
        SampleParams { cond_tau: 0., ..base },
    ] {
        assert!(matches!(ddim.sample(&params), Err(Error::Configuration(_))));
    }
    assert!(matches!(
        ddim.sample(&SampleParams { shape: &[4, 8], ..base }),
        Err(Error::ShapeMismatch { .. })
    ));
    assert_eq!(predictor.calls.get(), 0);
}

#[test]
fn intermediates_follow_log_every_t() -> anyhow::Result<()> {
    let predictor = MockPredictor::default();
    let sampler = sampler(&predictor, SamplerKind::dpm_solver());
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let x_t = fixed(&[1, 4, 8, 8], 2.);
    let params = SampleParams {
        x_t: Some(&x_t),
        log_every_t: 3,
        ..SampleParams::new(10, &shape, &cond, &cond)
    };
    let mut seen = vec![];
    let out = sampler.sample_with_callback(&params, |progress| seen.push(progress.timestep))?;
    assert_eq!(out.intermediates.x_inter.len(), 4);
    assert_eq!(out.intermediates.pred_x0.len(), 4);
    assert!(out.intermediates.x_inter.last().unwrap().equal(&out.latent));
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], 999);
    assert_eq!(seen[9], 0);
    Ok(())
}

#[test]
fn eta_adds_noise() -> anyhow::Result<()> {
    let _rng = lock_rng();
    let predictor = MockPredictor::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let x_t = fixed(&[1, 4, 8, 8], 2.);
    let params = SampleParams { x_t: Some(&x_t), ..SampleParams::new(10, &shape, &cond, &cond) };
    let deterministic = sampler.sample(&params)?.latent;
    let stochastic = sampler.sample(&SampleParams { eta: 1., ..params })?.latent;
    assert_finite(&stochastic);
    assert!(!deterministic.equal(&stochastic));
    Ok(())
}

#[test]
fn seeded_runs_reproduce() -> anyhow::Result<()> {
    let _rng = lock_rng();
    let predictor = MockPredictor::default();
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let uncond = fixed(&[1, 7, 8], 1.);
    for kind in kinds() {
        let sampler = sampler(&predictor, kind);
        let run = |seed| {
            let params = SampleParams { seed: Some(seed), ..SampleParams::new(10, &shape, &cond, &uncond) };
            sampler.sample(&params).map(|out| out.latent)
        };
        let (a, b, c) = (run(7)?, run(7)?, run(8)?);
        assert!(a.equal(&b), "{}", sampler.kind().name());
        assert!(!a.equal(&c), "{}", sampler.kind().name());
    }
    Ok(())
}

#[test]
fn inpainting_keeps_the_masked_region() -> anyhow::Result<()> {
    let _rng = lock_rng();
    let predictor = MockPredictor::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let options = (Kind::Float, Device::Cpu);
    let x0 = fixed(&[1, 4, 8, 8], 4.);
    // keep the left half
    let mask = Tensor::cat(&[Tensor::ones([1, 1, 8, 4], options), Tensor::zeros([1, 1, 8, 4], options)], 3);
    let inpaint = Inpaint { x0: x0.shallow_clone(), mask };

    let mut outputs = vec![];
    for phase in [2., 3.] {
        let x_t = fixed(&[1, 4, 8, 8], phase);
        let params = SampleParams {
            x_t: Some(&x_t),
            inpaint: Some(&inpaint),
            ..SampleParams::new(20, &shape, &cond, &cond)
        };
        tch::manual_seed(0);
        outputs.push(sampler.sample(&params)?.latent);
    }
    let (kept_a, kept_b) = (outputs[0].narrow(3, 0, 4), outputs[1].narrow(3, 0, 4));
    // the kept half only depends on x0, the other one on the starting latent
    assert!(kept_a.equal(&kept_b));
    assert!(!outputs[0].narrow(3, 4, 4).equal(&outputs[1].narrow(3, 4, 4)));
    let err = (kept_a - x0.narrow(3, 0, 4)).abs().mean(Kind::Float).double_value(&[]);
    assert!(err < 0.1, "{err}");
    Ok(())
}

#[test]
fn inpainting_mask_must_broadcast() {
    let predictor = MockPredictor::default();
    let sampler = sampler(&predictor, SamplerKind::ddim());
    let shape = [4, 8, 8];
    let cond = fixed(&[1, 7, 8], 0.);
    let options = (Kind::Float, Device::Cpu);
    for mask_shape in [[1, 1, 5, 5], [1, 3, 8, 8], [2, 1, 8, 8]] {
        let inpaint = Inpaint { x0: Tensor::zeros([1, 4, 8, 8], options), mask: Tensor::ones(mask_shape, options) };
        let params = SampleParams { inpaint: Some(&inpaint), ..SampleParams::new(10, &shape, &cond, &cond) };
        assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })), "{mask_shape:?}");
    }
    let inpaint = Inpaint { x0: Tensor::zeros([1, 4, 8, 8], options), mask: Tensor::ones([1, 8, 8], options) };
    let params = SampleParams { inpaint: Some(&inpaint), ..SampleParams::new(10, &shape, &cond, &cond) };
    assert!(matches!(sampler.sample(&params), Err(Error::ShapeMismatch { .. })));
    assert_eq!(predictor.calls.get(), 0);
}
