//! Per-run context: output locations, seeded randomness, device and logging.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use oorandom::Rand64;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const BEST_MODEL_FILE: &str = "model.best.mdl";
pub const DEV_RESULT_FILE: &str = "result.dev.bio";
pub const TEST_RESULT_FILE: &str = "result.test.bio";

/// Everything about a run that is not model or training state.
///
/// The random generator lives here so that parameter initialization and
/// epoch shuffling draw from one seeded stream.
pub struct RunContext {
    output_dir: PathBuf,
    seed: u64,
    rng: Rand64,
    device: Device,
}

impl RunContext {
    /// Create `<output_root>/<YYYYmmdd_HHMMSS>/` and bind the run to it.
    pub fn create(output_root: &Path, seed: u64, device: Device) -> Result<Self> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let output_dir = output_root.join(timestamp);
        std::fs::create_dir(&output_dir)
            .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
        info!("Output directory: {}", output_dir.display());
        Ok(Self::in_dir(output_dir, seed, device))
    }

    /// Bind a run to an existing directory.
    pub fn in_dir(output_dir: PathBuf, seed: u64, device: Device) -> Self {
        Self {
            output_dir,
            seed,
            rng: Rand64::new(seed as u128),
            device,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn best_model_file(&self) -> PathBuf {
        self.output_dir.join(BEST_MODEL_FILE)
    }

    pub fn dev_result_file(&self) -> PathBuf {
        self.output_dir.join(DEV_RESULT_FILE)
    }

    pub fn test_result_file(&self) -> PathBuf {
        self.output_dir.join(TEST_RESULT_FILE)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut Rand64 {
        &mut self.rng
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// CUDA device `ordinal` when available, CPU otherwise.
pub fn select_device(ordinal: usize) -> Result<Device> {
    let device = Device::cuda_if_available(ordinal)?;
    info!(?device, "selected device");
    Ok(device)
}

/// Install the global `fmt` subscriber, honouring `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A permutation of `0..len` (Fisher-Yates).
pub fn shuffled_order(len: usize, rng: &mut Rand64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        order.swap(i, j);
    }
    order
}
