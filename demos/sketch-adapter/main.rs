// Sketch guided text-to-image sampling.
//
// The networks are loaded as TorchScript modules, exported beforehand with
// `torch.jit.trace` or `torch.jit.script`:
// - data/unet.pt: (latent, timesteps, context, features) -> noise
// - data/adapter.pt: (edge map) -> list of feature maps
// - data/edge.pt: (image) -> edge maps, only used with `--type-in image`
// - data/clip.pt: (list of prompts) -> text embeddings
// - data/vae.pt: (latent) -> image
//
// Outputs are written to experiments/<name>/visualization.
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use t2i_adapter::models::jit::{
    JitAdapter, JitDecoder, JitEdgeDetector, JitNoisePredictor, JitTextEncoder,
};
use t2i_adapter::models::{ConditioningAdapter, Decoder, EdgeDetector, TextEncoder};
use t2i_adapter::pipelines::{self, SampleParams, Sampler};
use t2i_adapter::schedulers::SamplerKind;
use tch::{Device, Kind, Tensor};

const NEGATIVE_PROMPT: &str = "ugly, tiling, poorly drawn hands, poorly drawn feet, \
    poorly drawn face, out of frame, extra limbs, disfigured, deformed, body out of frame, \
    bad anatomy, watermark, signature, cut off, low contrast, underexposed, overexposed, \
    bad art, beginner, amateur, distorted face";

const EDGE_SIZE: i64 = 512;
const EDGE_THRESHOLD: f64 = 0.5;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to be used for image generation.
    #[arg(long, default_value = "A car with flying wings")]
    prompt: String,

    /// The conditioning image: a sketch, or a photo to extract edges from.
    #[arg(long, value_name = "FILE")]
    path_cond: PathBuf,

    /// How the conditioning image is turned into an edge map.
    #[arg(long, value_enum, default_value = "sketch")]
    type_in: InputType,

    /// Use the PLMS sampler.
    #[arg(long, action)]
    plms: bool,

    /// Use the DPM-Solver++ sampler, takes precedence over --plms.
    #[arg(long, action)]
    dpm_solver: bool,

    /// When set, use the CPU for the listed devices, can be 'all', 'unet', 'adapter', etc.
    /// Multiple values can be set.
    #[arg(long)]
    cpu: Vec<String>,

    /// The TorchScript noise predictor.
    #[arg(long, value_name = "FILE", default_value = "data/unet.pt")]
    unet_weights: PathBuf,

    /// The TorchScript sketch adapter.
    #[arg(long, value_name = "FILE", default_value = "data/adapter.pt")]
    adapter_weights: PathBuf,

    /// The TorchScript edge detector.
    #[arg(long, value_name = "FILE", default_value = "data/edge.pt")]
    edge_weights: PathBuf,

    /// The TorchScript text encoder.
    #[arg(long, value_name = "FILE", default_value = "data/clip.pt")]
    clip_weights: PathBuf,

    /// The TorchScript decoder.
    #[arg(long, value_name = "FILE", default_value = "data/vae.pt")]
    vae_weights: PathBuf,

    /// Feature channels produced by the adapter, one per level.
    #[arg(long, value_delimiter = ',', default_value = "320,640,1280,1280")]
    adapter_channels: Vec<i64>,

    /// Image height in pixels.
    #[arg(long = "H", default_value_t = 512)]
    height: i64,

    /// Image width in pixels.
    #[arg(long = "W", default_value_t = 512)]
    width: i64,

    /// Latent channels.
    #[arg(long = "C", default_value_t = 4)]
    channels: i64,

    /// Downsampling factor between the image and the latent.
    #[arg(long = "f", default_value_t = 8)]
    factor: i64,

    /// The number of denoising steps.
    #[arg(long, default_value_t = 50)]
    ddim_steps: usize,

    /// The number of samples to generate.
    #[arg(long, default_value_t = 1)]
    n_samples: i64,

    /// DDIM stochasticity, 0 is deterministic.
    #[arg(long, default_value_t = 0.)]
    ddim_eta: f64,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.5)]
    scale: f64,

    /// The random seed, sample `i` uses `seed + i`.
    #[arg(long, default_value_t = 42)]
    seed: i64,

    /// Experiment name, outputs go to experiments/<name>.
    #[arg(long, default_value = "test_sketch")]
    name: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum InputType {
    /// A hand drawn sketch, black background.
    Sketch,
    /// A photo passed through the edge detection network.
    Image,
    /// A photo passed through a Canny edge detector.
    Canny,
}

impl InputType {
    /// A binary `[1, 1, 512, 512]` edge map.
    fn edge_map(&self, path: &Path, detector: Option<&JitEdgeDetector>) -> anyhow::Result<Tensor> {
        let edges = match self {
            Self::Sketch => {
                let image = tch::vision::image::load(path)?;
                let image = tch::vision::image::resize(&image, EDGE_SIZE, EDGE_SIZE)?;
                image.narrow(0, 0, 1).unsqueeze(0).to_kind(Kind::Float) / 255.
            }
            Self::Image => {
                let image = tch::vision::image::load(path)?;
                let image = tch::vision::image::resize(&image, EDGE_SIZE, EDGE_SIZE)?;
                let image = image.unsqueeze(0).to_kind(Kind::Float) / 255.;
                let detector = detector.context("no edge detector loaded")?;
                detector.detect(&image)?.to_device(Device::Cpu)
            }
            Self::Canny => {
                use image::EncodableLayout;
                let image = image::open(path)?
                    .resize_exact(
                        EDGE_SIZE as u32,
                        EDGE_SIZE as u32,
                        image::imageops::FilterType::Triangle,
                    )
                    .to_luma8();
                let edges = imageproc::edges::canny(&image, 50., 100.);
                let tensor = Tensor::f_from_data_size(
                    edges.as_bytes(),
                    &[1, 1, edges.height() as i64, edges.width() as i64],
                    Kind::Uint8,
                )?;
                tensor.to_kind(Kind::Float) / 255.
            }
        };
        Ok(pipelines::binarize(&edges, EDGE_THRESHOLD))
    }
}

/// Creates `path`, moving an existing directory out of the way first.
fn mkdir_and_archive(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs();
        let mut archived = path.as_os_str().to_owned();
        archived.push(format!("_archived_{timestamp}"));
        tracing::warn!("{} already exists, renaming it to {:?}", path.display(), archived);
        std::fs::rename(path, &archived)
            .with_context(|| format!("cannot archive {}", path.display()))?;
    }
    std::fs::create_dir_all(path.join("visualization"))
        .with_context(|| format!("cannot create {}", path.display()))?;
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let Args {
        prompt,
        path_cond,
        type_in,
        plms,
        dpm_solver,
        cpu,
        height,
        width,
        channels,
        factor,
        ddim_steps,
        n_samples,
        ddim_eta,
        scale,
        seed,
        name,
        adapter_channels,
        ..
    } = args;
    tch::maybe_init_cuda();
    tracing::info!("Cuda available: {}", tch::Cuda::is_available());
    tracing::info!("MPS available: {}", tch::utils::has_mps());

    let experiment_root = Path::new("experiments").join(&name);
    mkdir_and_archive(&experiment_root)?;
    let visualization = experiment_root.join("visualization");

    let device_setup = t2i_adapter::utils::DeviceSetup::new(cpu);
    let unet_device = device_setup.get("unet");
    let adapter_device = device_setup.get("adapter");
    let _no_grad_guard = tch::no_grad_guard();

    tracing::info!("Building the text encoder.");
    let text_encoder = JitTextEncoder::new(&args.clip_weights, device_setup.get("clip"))
        .context("loading the text encoder")?;
    let cond = text_encoder.encode(&prompt)?;
    let uncond = text_encoder.encode(NEGATIVE_PROMPT)?;

    let edge_detector = match type_in {
        InputType::Image => Some(
            JitEdgeDetector::new(&args.edge_weights, device_setup.get("edge"))
                .context("loading the edge detector")?,
        ),
        InputType::Sketch | InputType::Canny => None,
    };
    tracing::info!("Building the adapter.");
    let adapter = JitAdapter::new(&args.adapter_weights, adapter_device)
        .context("loading the adapter")?;
    tracing::info!("Building the unet.");
    let unet = JitNoisePredictor::new(&args.unet_weights, unet_device, adapter_channels)
        .context("loading the noise predictor")?;
    tracing::info!("Building the autoencoder.");
    let vae = JitDecoder::new(&args.vae_weights, device_setup.get("vae"))
        .context("loading the decoder")?;

    let kind = if dpm_solver {
        SamplerKind::dpm_solver()
    } else if plms {
        SamplerKind::plms()
    } else {
        SamplerKind::ddim()
    };
    let config = pipelines::SamplerConfig { device: unet_device, ..Default::default() };
    let sampler = Sampler::with_config(&unet, kind, config)?;
    let shape = [channels, height / factor, width / factor];

    tracing::info!("Running with prompt \"{prompt}\".");
    for v_idx in 0..n_samples {
        let edge = type_in
            .edge_map(&path_cond, edge_detector.as_ref())
            .with_context(|| format!("preparing the edge map from {}", path_cond.display()))?;
        let edge_image = (&edge * 255.).to_kind(Kind::Uint8).squeeze_dim(0).repeat([3, 1, 1]);
        tch::vision::image::save(&edge_image, visualization.join(format!("edge_idx{v_idx:04}.png")))?;

        let features = adapter.extract(&edge.to_device(adapter_device))?;
        let params = SampleParams {
            guidance_scale: scale,
            eta: ddim_eta,
            features: Some(&features),
            seed: Some(seed + v_idx),
            ..SampleParams::new(ddim_steps, &shape, &cond, &uncond)
        };
        let samples = sampler.sample(&params)?;

        tracing::info!("Generating the final image for sample {}/{}.", v_idx + 1, n_samples);
        let images = pipelines::postprocess(&vae.decode(&samples.latent)?);
        for id_sample in 0..images.size()[0] {
            let filename = visualization.join(format!("sample_idx{v_idx:04}_s{id_sample:04}.png"));
            tch::vision::image::save(&images.get(id_sample), filename)?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run(Args::parse())
}
