//! # Adapter guided diffusion sampling
//!
//! Iterative denoising samplers for latent diffusion models steered by a
//! structural adapter, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A shared noise schedule and the DDIM, PLMS and DPM-Solver update rules.
//! - A sampling loop with classifier-free guidance and adapter feature fusion.
//! - TorchScript wrappers so that the denoising network, the adapter, the
//!   edge detector, the text encoder and the decoder can be plugged in as
//!   opaque functions.

pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};
