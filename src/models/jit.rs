//! TorchScript implementations of the model traits.
//!
//! The networks are exported from Python with `torch.jit.script` or
//! `torch.jit.trace` and loaded as opaque modules, so no architecture is
//! reimplemented here. Expected signatures:
//! - noise predictor: `(latent, timesteps: long[batch], context, features: List[Tensor]?) -> Tensor`
//! - adapter: `(structural_input) -> List[Tensor]`
//! - edge detector: `(image) -> Tensor | List[Tensor]`, the last output is used
//! - text encoder: `(prompts: List[str]) -> Tensor`
//! - decoder: `(latent) -> Tensor`
use super::{AdapterFeatures, ConditioningAdapter, Decoder, EdgeDetector, NoisePredictor, TextEncoder};
use crate::Result;
use std::path::Path;
use tch::{CModule, Device, IValue, Kind, TchError, Tensor};

/// Scaling applied to latents by the Stable Diffusion v1 autoencoder.
pub const LATENT_SCALE_FACTOR: f64 = 0.18215;

fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<CModule> {
    let mut module = CModule::load_on_device(path.as_ref(), device)?;
    module.set_eval();
    Ok(module)
}

fn tensors(value: IValue, what: &str) -> Result<Vec<Tensor>> {
    match value {
        IValue::Tensor(t) => Ok(vec![t]),
        IValue::TensorList(ts) => Ok(ts),
        IValue::Tuple(vs) | IValue::GenericList(vs) => {
            vs.into_iter().map(|v| tensor(v, what)).collect()
        }
        v => Err(TchError::Convert(format!("{what}: expected tensors, got {v:?}")).into()),
    }
}

fn tensor(value: IValue, what: &str) -> Result<Tensor> {
    match value {
        IValue::Tensor(t) => Ok(t),
        v => Err(TchError::Convert(format!("{what}: expected a tensor, got {v:?}")).into()),
    }
}

pub struct JitNoisePredictor {
    module: CModule,
    device: Device,
    adapter_channels: Vec<i64>,
}

impl JitNoisePredictor {
    pub fn new<P: AsRef<Path>>(path: P, device: Device, adapter_channels: Vec<i64>) -> Result<Self> {
        let module = load(path, device)?;
        Ok(Self { module, device, adapter_channels })
    }
}

impl NoisePredictor for JitNoisePredictor {
    fn predict(
        &self,
        latent: &Tensor,
        timestep: f64,
        conditioning: &Tensor,
        features: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        let batch = latent.size()[0];
        let timesteps = Tensor::full([batch], timestep as i64, (Kind::Int64, self.device));
        let features = match features {
            None => IValue::None,
            Some(f) => {
                IValue::TensorList(f.levels().iter().map(|l| l.to_device(self.device)).collect())
            }
        };
        let output = self.module.forward_is(&[
            IValue::Tensor(latent.to_device(self.device)),
            IValue::Tensor(timesteps),
            IValue::Tensor(conditioning.to_device(self.device)),
            features,
        ])?;
        let output = tensor(output, "noise predictor")?;
        Ok(output.to_device(latent.device()))
    }

    fn adapter_channels(&self) -> Vec<i64> {
        self.adapter_channels.clone()
    }
}

pub struct JitAdapter {
    module: CModule,
    device: Device,
}

impl JitAdapter {
    pub fn new<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        Ok(Self { module: load(path, device)?, device })
    }
}

impl ConditioningAdapter for JitAdapter {
    fn extract(&self, structural_input: &Tensor) -> Result<AdapterFeatures> {
        let output =
            self.module.forward_is(&[IValue::Tensor(structural_input.to_device(self.device))])?;
        Ok(AdapterFeatures::new(tensors(output, "adapter")?))
    }
}

pub struct JitEdgeDetector {
    module: CModule,
    device: Device,
}

impl JitEdgeDetector {
    pub fn new<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        Ok(Self { module: load(path, device)?, device })
    }
}

impl EdgeDetector for JitEdgeDetector {
    fn detect(&self, image: &Tensor) -> Result<Tensor> {
        let output = self.module.forward_is(&[IValue::Tensor(image.to_device(self.device))])?;
        // multi-scale detectors return their side outputs first and the fused map last
        tensors(output, "edge detector")?
            .pop()
            .ok_or_else(|| TchError::Convert("edge detector: empty output".to_string()).into())
    }
}

pub struct JitTextEncoder {
    module: CModule,
}

impl JitTextEncoder {
    pub fn new<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        Ok(Self { module: load(path, device)? })
    }
}

impl TextEncoder for JitTextEncoder {
    fn encode(&self, prompt: &str) -> Result<Tensor> {
        let output = self.module.forward_is(&[IValue::StringList(vec![prompt.to_string()])])?;
        tensor(output, "text encoder")
    }
}

pub struct JitDecoder {
    module: CModule,
    device: Device,
    scale_factor: f64,
}

impl JitDecoder {
    pub fn new<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        Ok(Self { module: load(path, device)?, device, scale_factor: LATENT_SCALE_FACTOR })
    }
}

impl Decoder for JitDecoder {
    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        let latent = latent.to_device(self.device) / self.scale_factor;
        Ok(self.module.forward_ts(&[latent])?)
    }
}
