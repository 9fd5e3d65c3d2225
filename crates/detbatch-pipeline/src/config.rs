use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use detbatch_core::{DetError, Result};

/// How a batch is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Decode, detect and write each file in turn on the calling thread.
    /// Baseline for throughput comparisons.
    Sequential,
    /// One worker-pool task per file doing all three steps.
    Pooled,
    /// Producer, inference and writer stages overlapped on separate threads,
    /// connected by queues. The fastest mode and the default.
    #[default]
    Pipelined,
}

/// Runtime configuration for a detection batch.
///
/// Every field has a default, so a JSON config only needs to name what it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Detector model file. Required by back-ends that load a model.
    pub model_path: Option<PathBuf>,
    /// Minimum score for a detection to be reported.
    pub confidence_threshold: f32,

    /// Inference worker threads; also the number of detector shards.
    pub workers: usize,
    /// Slab pool capacity as a multiple of `workers`.
    pub pool_capacity_multiplier: usize,
    /// Exact slab count, taking precedence over the multiplier.
    pub pool_capacity_override: Option<usize>,
    /// Dedicated result-writing threads. 0 writes on the writer stage thread.
    pub savers: usize,
    pub mode: ExecutionMode,

    /// Directory scanned for images.
    pub input_dir: PathBuf,
    /// Directory receiving one `.txt` file per image.
    pub output_dir: PathBuf,
    /// Maximum directory depth to scan. `None` = unlimited, `Some(1)` = top level only.
    pub max_depth: Option<usize>,
    /// File extensions treated as images (case-insensitive, without the dot).
    pub extensions: Vec<String>,

    // Model input.
    pub input_width: u32,
    pub input_height: u32,
    /// Stretch images to the input size instead of letterboxing.
    pub scale_fill: bool,

    /// Sleep between slab acquisition attempts while the pool is exhausted.
    pub backoff_ms: u64,
    /// Log progress every N files. 0 disables progress lines.
    pub progress_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            confidence_threshold: 0.5,

            workers: 4,
            pool_capacity_multiplier: 4,
            pool_capacity_override: None,
            savers: 0,
            mode: ExecutionMode::default(),

            input_dir: PathBuf::from("images"),
            output_dir: PathBuf::from("results"),
            max_depth: None,
            extensions: ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),

            input_width: 640,
            input_height: 640,
            scale_fill: true,

            backoff_ms: 10,
            progress_every: 200,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| DetError::Config(format!("{}: {e}", path.display())))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DetError::Config("workers must be at least 1".into()));
        }
        if self.pool_capacity_multiplier == 0 {
            return Err(DetError::Config(
                "pool_capacity_multiplier must be at least 1".into(),
            ));
        }
        match self.pool_capacity_override {
            Some(0) => {
                return Err(DetError::Config("pool_capacity_override must be at least 1".into()))
            }
            Some(_) => {}
            None => {
                if self.workers.checked_mul(self.pool_capacity_multiplier).is_none() {
                    return Err(DetError::Config(format!(
                        "pool capacity {} x {} overflows",
                        self.workers, self.pool_capacity_multiplier
                    )));
                }
            }
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(DetError::Config(format!(
                "model input size must be non-zero, got {}x{}",
                self.input_width, self.input_height
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DetError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    /// Number of slabs in the buffer pool. Saturates on configs that
    /// [`validate`](Self::validate) rejects.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity_override
            .unwrap_or_else(|| self.workers.saturating_mul(self.pool_capacity_multiplier))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
