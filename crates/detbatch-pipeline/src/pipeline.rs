use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;

use detbatch_core::{tensor_len, DetError, Detector, Result, Transform};
use detbatch_pool::{SlabPool, WorkerPool};

use crate::config::{ExecutionMode, PipelineConfig};
use crate::context::{PipelineContext, RunStats};
use crate::output::{ResultSink, ResultWriter};
use crate::shard::DetectorShards;
use crate::sources::collect_images;
use crate::stages::{self, StageSettings};

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: ExecutionMode,
    /// Files handed to the run.
    pub discovered: usize,
    /// Result files written.
    pub written: usize,
    pub decode_failures: usize,
    pub inference_failures: usize,
    pub write_failures: usize,
    pub pool_capacity: usize,
    /// Most slabs leased at the same time.
    pub peak_leased: usize,
    /// Free slabs once the run returned. Equal to `pool_capacity` unless a lease leaked.
    pub free_after: usize,
    /// Times the producer slept waiting for a free slab.
    pub backoff_waits: u64,
    pub elapsed_ms: f64,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.decode_failures + self.inference_failures + self.write_failures
    }

    /// Every discovered file produced a result file.
    pub fn is_complete(&self) -> bool {
        self.failures() == 0 && self.written == self.discovered
    }

    pub fn images_per_second(&self) -> f64 {
        if self.elapsed_ms > 0.0 {
            self.written as f64 * 1000.0 / self.elapsed_ms
        } else {
            0.0
        }
    }
}

/// Runs detection batches with a fixed set of workers and detector shards.
///
/// Threads and detectors are created once in [`build`](Self::build) and
/// reused by every [`run`](Self::run). Queues, completion flags and the slab
/// pool are created fresh for each run.
pub struct BatchRunner<T, D> {
    config: PipelineConfig,
    transform: Arc<T>,
    workers: WorkerPool,
    shards: Arc<DetectorShards<D>>,
    savers: Option<WorkerPool>,
    writer: Arc<dyn ResultSink>,
}

impl<T, D> BatchRunner<T, D>
where
    T: Transform + 'static,
    D: Detector + 'static,
{
    /// Validate `config`, spawn the worker pools and build one detector per
    /// inference worker with `factory(worker_identity)`.
    pub fn build<F>(config: PipelineConfig, transform: T, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<D> + Send + Sync + 'static,
    {
        config.validate()?;

        let workers = WorkerPool::new("infer", config.workers)?;
        let shards = Arc::new(DetectorShards::build(&workers, factory)?);
        let savers = match config.savers {
            0 => None,
            n => Some(WorkerPool::new("saver", n)?),
        };
        let writer: Arc<dyn ResultSink> = Arc::new(ResultWriter::new(&config.output_dir)?);

        tracing::info!(
            mode = ?config.mode,
            workers = config.workers,
            savers = config.savers,
            pool_capacity = config.pool_capacity(),
            input = %format!("{}x{}", config.input_width, config.input_height),
            output_dir = %config.output_dir.display(),
            "batch runner ready"
        );

        Ok(Self {
            config,
            transform: Arc::new(transform),
            workers,
            shards,
            savers,
            writer,
        })
    }

    /// Send results to `sink` instead of the files under `output_dir`.
    pub fn with_sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.writer = Arc::new(sink);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shards(&self) -> &DetectorShards<D> {
        &self.shards
    }

    /// Enumerate `config.input_dir` and run over what was found.
    pub fn run_dir(&self) -> Result<RunReport> {
        let sources = collect_images(
            &self.config.input_dir,
            self.config.max_depth,
            &self.config.extensions,
        )?;
        self.run(&sources)
    }

    /// Process `sources` in the configured mode.
    ///
    /// Per-image failures are logged, counted in the report and skipped.
    /// An `Err` means the run itself broke (a stage panicked or a thread
    /// could not be spawned).
    pub fn run(&self, sources: &[PathBuf]) -> Result<RunReport> {
        let slabs = Arc::new(SlabPool::new(
            tensor_len(self.config.input_width, self.config.input_height),
            self.config.pool_capacity(),
        )?);
        let ctx = Arc::new(PipelineContext::new(Arc::clone(&slabs)));
        let settings = self.stage_settings();

        tracing::info!(files = sources.len(), mode = ?self.config.mode, "starting run");
        let start = Instant::now();

        match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(&ctx, sources, &settings),
            ExecutionMode::Pooled => self.run_pooled(&ctx, sources, &settings),
            ExecutionMode::Pipelined => self.run_pipelined(&ctx, sources, &settings)?,
        }

        let elapsed = start.elapsed();
        if !slabs.is_balanced() {
            tracing::error!(
                leased = slabs.leased_count(),
                capacity = slabs.capacity(),
                "slabs still leased after run"
            );
        }

        let stats = &ctx.stats;
        let report = RunReport {
            mode: self.config.mode,
            discovered: sources.len(),
            written: RunStats::get(&stats.written),
            decode_failures: RunStats::get(&stats.decode_failures),
            inference_failures: RunStats::get(&stats.inference_failures),
            write_failures: RunStats::get(&stats.write_failures),
            pool_capacity: slabs.capacity(),
            peak_leased: slabs.peak_leased(),
            free_after: slabs.free_count(),
            backoff_waits: slabs.backoff_waits(),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        };

        tracing::info!(
            written = report.written,
            failures = report.failures(),
            peak_leased = report.peak_leased,
            elapsed_ms = %format!("{:.1}", report.elapsed_ms),
            images_per_sec = %format!("{:.1}", report.images_per_second()),
            "run finished"
        );
        Ok(report)
    }

    fn stage_settings(&self) -> StageSettings {
        StageSettings {
            input_width: self.config.input_width,
            input_height: self.config.input_height,
            scale_fill: self.config.scale_fill,
            backoff: self.config.backoff(),
            progress_every: self.config.progress_every,
        }
    }

    /// Every step on the calling thread, using shard 0.
    fn run_sequential(&self, ctx: &PipelineContext, sources: &[PathBuf], settings: &StageSettings) {
        for (i, source) in sources.iter().enumerate() {
            settings.log_progress(i, sources.len());
            let item = match stages::prepare(&ctx.slabs, &*self.transform, source, settings) {
                Ok(item) => item,
                Err(e) => {
                    stages::record_prepare_failure(&ctx.stats, source, &e);
                    continue;
                }
            };
            match stages::infer(&self.shards, 0, item) {
                Ok(result) => stages::persist(&ctx.stats, &*self.writer, &result),
                Err(e) => stages::record_inference_failure(&ctx.stats, source, 0, &e),
            }
        }
    }

    /// One pool task per file doing decode, detect and write.
    fn run_pooled(&self, ctx: &Arc<PipelineContext>, sources: &[PathBuf], settings: &StageSettings) {
        for (i, source) in sources.iter().enumerate() {
            settings.log_progress(i, sources.len());
            let ctx = Arc::clone(ctx);
            let transform = Arc::clone(&self.transform);
            let shards = Arc::clone(&self.shards);
            let writer = Arc::clone(&self.writer);
            let settings = *settings;
            let source = source.clone();

            self.workers.run(move |worker| {
                let item = match stages::prepare(&ctx.slabs, &*transform, &source, &settings) {
                    Ok(item) => item,
                    Err(e) => return stages::record_prepare_failure(&ctx.stats, &source, &e),
                };
                match stages::infer(&shards, worker, item) {
                    Ok(result) => stages::persist(&ctx.stats, &*writer, &result),
                    Err(e) => stages::record_inference_failure(&ctx.stats, &source, worker, &e),
                }
            });
        }
        self.workers.join();
    }

    /// Producer, inference and writer on their own threads.
    fn run_pipelined(
        &self,
        ctx: &Arc<PipelineContext>,
        sources: &[PathBuf],
        settings: &StageSettings,
    ) -> Result<()> {
        thread::scope(|scope| {
            // Spawned downstream-first. If a later spawn fails, the flag that
            // stage would have set is set here so the running stages drain and exit.
            let writer = thread::Builder::new()
                .name("writer".into())
                .spawn_scoped(scope, || {
                    stages::run_writer(ctx, &self.writer, self.savers.as_ref())
                })
                .map_err(|e| spawn_failed("writer", e))?;

            let inference = match thread::Builder::new()
                .name("inference".into())
                .spawn_scoped(scope, || stages::run_inference(ctx, &self.workers, &self.shards))
            {
                Ok(handle) => handle,
                Err(e) => {
                    ctx.input.finish(&ctx.producer_done);
                    ctx.output.finish(&ctx.inference_done);
                    return Err(spawn_failed("inference", e));
                }
            };

            let producer = match thread::Builder::new()
                .name("producer".into())
                .spawn_scoped(scope, || {
                    stages::run_producer(ctx, &*self.transform, sources, settings)
                }) {
                Ok(handle) => handle,
                Err(e) => {
                    ctx.input.finish(&ctx.producer_done);
                    return Err(spawn_failed("producer", e));
                }
            };

            let mut panicked = Vec::new();
            for (stage, handle) in [("producer", producer), ("inference", inference), ("writer", writer)] {
                if handle.join().is_err() {
                    tracing::error!(stage, "pipeline stage panicked");
                    panicked.push(stage);
                }
            }
            if panicked.is_empty() {
                Ok(())
            } else {
                Err(DetError::Pipeline(format!(
                    "stage(s) panicked: {}",
                    panicked.join(", ")
                )))
            }
        })
    }
}

fn spawn_failed(stage: &str, e: std::io::Error) -> DetError {
    DetError::Pipeline(format!("failed to spawn {stage} thread: {e}"))
}

impl<T, D> std::fmt::Debug for BatchRunner<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("mode", &self.config.mode)
            .field("workers", &self.workers.size())
            .field("savers", &self.savers.as_ref().map(WorkerPool::size))
            .field("output_dir", &self.config.output_dir)
            .finish()
    }
}
