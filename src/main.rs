//! Temporal Self-Attention benchmark
//!
//! Builds a freshly initialized operator, feeds it deterministic BEV features and
//! reports output statistics and latency.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::time::Instant;

use bev_temporal_attn::debug::TensorStats;
use bev_temporal_attn::{
    level_start_index, SamplerPolicy, TemporalAttentionConfig, TemporalAttentionInput,
    TemporalSelfAttention,
};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;
use clap::{Parser, ValueEnum};

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum Sampler {
    Auto,
    Portable,
    Fused,
}

impl From<Sampler> for SamplerPolicy {
    fn from(s: Sampler) -> Self {
        match s {
            Sampler::Auto => SamplerPolicy::Auto,
            Sampler::Portable => SamplerPolicy::Portable,
            Sampler::Fused => SamplerPolicy::Fused,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// JSON config, defaults to the BEVFormer base settings.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// BEV grid height.
    #[arg(long, default_value_t = 50)]
    height: usize,

    /// BEV grid width.
    #[arg(long, default_value_t = 50)]
    width: usize,

    /// Query batch size.
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Number of BEV frames present in the queue.
    #[arg(long, default_value_t = 2)]
    frames: usize,

    /// Timed forward passes.
    #[arg(long, default_value_t = 10)]
    runs: usize,

    /// Override the sampler selection.
    #[arg(long, value_enum)]
    sampler: Option<Sampler>,
}

/// Deterministic BEV features [num_query, batch, embed_dims]
fn bev_features(
    num_query: usize,
    batch: usize,
    embed_dims: usize,
    seed: f32,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..num_query * batch * embed_dims)
        .map(|i| {
            let (q, rest) = (i / (batch * embed_dims), i % (batch * embed_dims));
            let (b, c) = (rest / embed_dims, rest % embed_dims);
            seed + (b + 1) as f32 * 0.1 + (c + 1) as f32 * 0.01 + q as f32 * 0.001
        })
        .collect();
    Tensor::from_vec(data, (num_query, batch, embed_dims), device)
}

/// Cell-center reference points [frames, H*W, num_levels, 2]
fn bev_reference_points(
    height: usize,
    width: usize,
    frames: usize,
    num_levels: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(frames * height * width * num_levels * 2);
    for _ in 0..frames {
        for y in 0..height {
            for x in 0..width {
                for _ in 0..num_levels {
                    data.push((x as f32 + 0.5) / width as f32);
                    data.push((y as f32 + 0.5) / height as f32);
                }
            }
        }
    }
    Tensor::from_vec(data, (frames, height * width, num_levels, 2), device)
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let device = device(args.cpu)?;
    println!("Using device: {:?}", device);

    let mut config = match &args.config {
        Some(path) => TemporalAttentionConfig::from_json_file(path)?,
        None => TemporalAttentionConfig::bevformer_base(),
    };
    config.batch_first = false;
    if let Some(sampler) = args.sampler {
        config.sampler = sampler.into();
    }
    if config.num_levels != 1 {
        anyhow::bail!(
            "the benchmark feeds a single BEV level, config asks for {} levels",
            config.num_levels
        );
    }
    println!("Config: {:?}", config);

    let mut varmap = VarMap::new();
    let attn = TemporalSelfAttention::init(config.clone(), &mut varmap, DType::F32, &device)?;
    for advisory in attn.advisories() {
        println!("Advisory: {}", advisory);
    }

    let spatial_shapes = [(args.height, args.width)];
    let start = level_start_index(&spatial_shapes);
    let num_query = args.height * args.width;

    let query = bev_features(num_query, args.batch, config.embed_dims, 0.0, &device)?;
    let value = bev_features(num_query, args.frames, config.embed_dims, 0.5, &device)?;
    let reference_points =
        bev_reference_points(args.height, args.width, args.frames, config.num_levels, &device)?;

    let input = TemporalAttentionInput::new(&query, &reference_points, &spatial_shapes, &start)
        .with_value(&value);

    // Warm up
    for _ in 0..2 {
        let _ = attn.forward(&input, false)?;
    }
    device.synchronize()?;

    let start_time = Instant::now();
    let mut output = None;
    for _ in 0..args.runs.max(1) {
        output = Some(attn.forward(&input, false)?);
    }
    device.synchronize()?;
    let elapsed = start_time.elapsed();

    let output = match output {
        Some(o) => o,
        None => anyhow::bail!("no forward pass ran"),
    };
    println!("Input:  {}", TensorStats::from_tensor(&query)?);
    println!("Output: {}", TensorStats::from_tensor(&output)?);
    println!(
        "Average forward time over {} runs: {:.3} ms",
        args.runs.max(1),
        elapsed.as_secs_f64() * 1000.0 / args.runs.max(1) as f64
    );

    Ok(())
}
