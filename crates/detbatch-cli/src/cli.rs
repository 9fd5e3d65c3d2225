use std::path::PathBuf;

use clap::{Parser, Subcommand};

use detbatch_pipeline::{ExecutionMode, PipelineConfig};

#[derive(Parser)]
#[command(name = "detbatch", about = "Batch object detection over image directories", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to pipeline config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Detector model file.
    #[arg(long, global = true)]
    pub model: Option<PathBuf>,

    /// Minimum detection score.
    #[arg(long, global = true)]
    pub threshold: Option<f32>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Detect objects in every image of a directory and write one result file per image.
    Run {
        /// Directory scanned for images.
        input_dir: Option<PathBuf>,
        /// Directory receiving the result files.
        output_dir: Option<PathBuf>,
        /// Inference worker threads.
        #[arg(long)]
        workers: Option<usize>,
        /// Slab pool capacity as a multiple of the worker count.
        #[arg(long)]
        pool_multiplier: Option<usize>,
        /// Result-writing threads (0 = write on the writer stage thread).
        #[arg(long)]
        savers: Option<usize>,
        /// Scheduling mode.
        #[arg(long)]
        mode: Option<ModeArg>,
        /// Maximum directory depth to scan (1 = top level only).
        #[arg(long)]
        max_depth: Option<usize>,
        /// Print the run report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Run the detector on a single image and print its result lines.
    Detect {
        #[arg(required = true)]
        input: PathBuf,
        /// Repeat inference N times and report the mean latency.
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
    /// Print the effective configuration as JSON.
    ShowConfig,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum ModeArg {
    Sequential,
    Pooled,
    Pipelined,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => ExecutionMode::Sequential,
            ModeArg::Pooled => ExecutionMode::Pooled,
            ModeArg::Pipelined => ExecutionMode::Pipelined,
        }
    }
}

/// Load the config file (or defaults) and apply the global overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model_path = Some(model.clone());
    }
    if let Some(threshold) = cli.threshold {
        config.confidence_threshold = threshold;
    }
    Ok(config)
}

/// Overrides from `run` arguments.
pub struct RunOverrides {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub pool_multiplier: Option<usize>,
    pub savers: Option<usize>,
    pub mode: Option<ModeArg>,
    pub max_depth: Option<usize>,
}

impl RunOverrides {
    pub fn apply(self, config: &mut PipelineConfig) {
        if let Some(dir) = self.input_dir {
            config.input_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(multiplier) = self.pool_multiplier {
            config.pool_capacity_multiplier = multiplier;
        }
        if let Some(savers) = self.savers {
            config.savers = savers;
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if self.max_depth.is_some() {
            config.max_depth = self.max_depth;
        }
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;
    use std::time::Instant;

    use anyhow::Context;

    use detbatch_core::{tensor_len, Detector, ImageGeometry, Transform};
    use detbatch_detect::{ImageTransform, OnnxDetector};
    use detbatch_pipeline::{format_detections, BatchRunner, PipelineConfig, RunReport};

    fn model_path(config: &PipelineConfig) -> anyhow::Result<std::path::PathBuf> {
        let model = config
            .model_path
            .clone()
            .context("no detector model configured (use --model or model_path)")?;
        anyhow::ensure!(model.is_file(), "model file {} not found", model.display());
        Ok(model)
    }

    pub fn run_batch(config: PipelineConfig) -> anyhow::Result<RunReport> {
        let model = model_path(&config)?;
        let threshold = config.confidence_threshold;
        let runner = BatchRunner::build(config, ImageTransform::new(), move |worker| {
            tracing::debug!(worker, "loading detector shard");
            OnnxDetector::load(&model, threshold)
        })?;
        Ok(runner.run_dir()?)
    }

    pub fn detect_one(config: &PipelineConfig, input: &Path, repeat: usize) -> anyhow::Result<()> {
        config.validate()?;
        let model = model_path(config)?;
        let mut detector = OnnxDetector::load(&model, config.confidence_threshold)?;
        let transform = ImageTransform::new();

        let image = transform.decode(input)?;
        let mut tensor = vec![0.0f32; tensor_len(config.input_width, config.input_height)];
        let letterbox = transform.transform(
            &image,
            config.input_width,
            config.input_height,
            config.scale_fill,
            &mut tensor,
        )?;
        let geometry = ImageGeometry {
            original_width: image.width,
            original_height: image.height,
            input_width: config.input_width,
            input_height: config.input_height,
            letterbox,
        };

        let repeat = repeat.max(1);
        let start = Instant::now();
        let mut detections = Vec::new();
        for _ in 0..repeat {
            detections = detector.detect(&tensor, &geometry)?;
        }
        let mean_ms = start.elapsed().as_secs_f64() * 1000.0 / repeat as f64;

        println!("{}", format_detections(&detections));
        eprintln!(
            "[{} detections | {}x{} | {:.1}ms mean over {} run(s) | {}]",
            detections.len(),
            image.width,
            image.height,
            mean_ms,
            repeat,
            detector.name()
        );
        Ok(())
    }
}

#[cfg(not(feature = "onnx"))]
mod onnx {
    use std::path::Path;

    use detbatch_pipeline::{PipelineConfig, RunReport};

    const NO_BACKEND: &str =
        "detbatch was built without a detector back-end; rebuild with `--features onnx`";

    pub fn run_batch(_config: PipelineConfig) -> anyhow::Result<RunReport> {
        anyhow::bail!(NO_BACKEND)
    }

    pub fn detect_one(_config: &PipelineConfig, _input: &Path, _repeat: usize) -> anyhow::Result<()> {
        anyhow::bail!(NO_BACKEND)
    }
}

pub use onnx::{detect_one, run_batch};
