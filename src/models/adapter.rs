//! Adapter features and the way they are fused into the denoising network.
//!
//! An adapter produces one feature map per resolution level of the backbone
//! encoder. Level `i` has `1 / 2^i` of the latent resolution and is added to
//! the backbone activations of the same resolution at every step.
use crate::{Error, Result};
use std::str::FromStr;
use tch::{Device, Tensor};

/// Selects which adapter levels are injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
    /// Structural guidance (sketch, edges): every level.
    #[default]
    Sketch,
    /// Colour guidance: only the coarse half of the levels, a palette has no
    /// fine spatial detail to contribute.
    Color,
}

impl FusionMode {
    pub fn injects(&self, level: usize, n_levels: usize) -> bool {
        match self {
            Self::Sketch => true,
            Self::Color => level >= n_levels / 2,
        }
    }
}

impl FromStr for FusionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sketch" | "structure" => Ok(Self::Sketch),
            "color" => Ok(Self::Color),
            _ => Err(Error::config(format!("unsupported conditioning mode {s:?}"))),
        }
    }
}

/// Multi-scale features computed once from a structural input.
#[derive(Debug)]
pub struct AdapterFeatures {
    levels: Vec<Tensor>,
}

impl AdapterFeatures {
    pub fn new(levels: Vec<Tensor>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[Tensor] {
        self.levels.as_slice()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Checks the features against the channels a predictor expects for a
    /// `batch_size` batch of latents with spatial size `latent_hw`.
    pub fn validate(
        &self,
        expected_channels: &[i64],
        batch_size: i64,
        latent_hw: (i64, i64),
    ) -> Result<()> {
        if self.levels.len() != expected_channels.len() {
            return Err(Error::shape(
                "adapter feature levels",
                &[expected_channels.len() as i64],
                &[self.levels.len() as i64],
            ));
        }
        let (h, w) = latent_hw;
        for (level, (feature, &channels)) in
            self.levels.iter().zip(expected_channels.iter()).enumerate()
        {
            let size = feature.size();
            let scale = 1i64 << level;
            let (fh, fw) = ((h + scale - 1) / scale, (w + scale - 1) / scale);
            let batch_ok = size.first().map_or(false, |&b| b == 1 || b == batch_size);
            if size.len() != 4 || !batch_ok || size[1..] != [channels, fh, fw] {
                return Err(Error::shape(
                    format!("adapter feature level {level}"),
                    &[batch_size, channels, fh, fw],
                    &size,
                ));
            }
        }
        Ok(())
    }

    /// The features handed to the predictor during a run: levels not used by
    /// `mode` are zeroed, the others scaled by `weight`, and the batch is
    /// expanded to `batch_size` then repeated `copies` times, matching
    /// latents concatenated for guidance.
    pub(crate) fn prepare(
        &self,
        mode: FusionMode,
        weight: f64,
        batch_size: i64,
        copies: i64,
        device: Device,
    ) -> Self {
        let n_levels = self.levels.len();
        let levels = self
            .levels
            .iter()
            .enumerate()
            .map(|(level, feature)| {
                let feature = feature.to_device(device);
                let feature =
                    if mode.injects(level, n_levels) { feature * weight } else { feature.zeros_like() };
                let mut repeats = vec![1; feature.dim()];
                repeats[0] = batch_size / feature.size()[0] * copies;
                feature.repeat(repeats.as_slice())
            })
            .collect();
        Self { levels }
    }
}
