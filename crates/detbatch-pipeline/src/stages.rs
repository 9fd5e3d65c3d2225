//! Bodies of the producer, inference and writer stages, plus the per-item
//! steps the non-pipelined modes reuse.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use detbatch_core::{DetError, Detector, ImageGeometry, Result, Transform};
use detbatch_pool::{SlabPool, WorkerPool};

use crate::context::{PipelineContext, ResultItem, RunStats, WorkItem};
use crate::output::ResultSink;
use crate::shard::DetectorShards;

/// Settings every stage needs, copied out of the config once per run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageSettings {
    pub input_width: u32,
    pub input_height: u32,
    pub scale_fill: bool,
    pub backoff: Duration,
    pub progress_every: usize,
}

impl StageSettings {
    pub fn log_progress(&self, done: usize, total: usize) {
        if self.progress_every > 0 && done > 0 && done % self.progress_every == 0 {
            tracing::info!(done, total, "progress");
        }
    }
}

/// Decode `source` and transform it into a freshly leased slab.
///
/// Blocks with backoff while the pool is exhausted. On error the slab (if
/// any) has already gone back to the pool. A panicking transform counts as a
/// transform failure.
pub(crate) fn prepare<T: Transform + ?Sized>(
    slabs: &Arc<SlabPool<f32>>,
    transform: &T,
    source: &Path,
    settings: &StageSettings,
) -> Result<WorkItem> {
    let image = panic::catch_unwind(AssertUnwindSafe(|| transform.decode(source)))
        .map_err(|payload| {
            DetError::Transform(format!("decode panicked: {}", panic_message(&*payload)))
        })??;

    let mut buffer = slabs.acquire_with_backoff(settings.backoff);
    let letterbox = panic::catch_unwind(AssertUnwindSafe(|| {
        transform.transform(
            &image,
            settings.input_width,
            settings.input_height,
            settings.scale_fill,
            buffer.as_mut_slice(),
        )
    }))
    .map_err(|payload| {
        DetError::Transform(format!("transform panicked: {}", panic_message(&*payload)))
    })??;

    Ok(WorkItem {
        buffer,
        source: source.to_path_buf(),
        geometry: ImageGeometry {
            original_width: image.width,
            original_height: image.height,
            input_width: settings.input_width,
            input_height: settings.input_height,
            letterbox,
        },
    })
}

/// Run shard `worker` on `item`, releasing its slab as soon as the detector
/// returns. A panicking detector counts as an inference failure.
pub(crate) fn infer<D: Detector>(
    shards: &DetectorShards<D>,
    worker: usize,
    item: WorkItem,
) -> Result<ResultItem> {
    let WorkItem {
        buffer,
        source,
        geometry,
    } = item;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        shards.detect(worker, buffer.as_slice(), &geometry)
    }));
    drop(buffer);

    let detections = outcome.map_err(|payload| {
        DetError::Inference(format!("detector panicked: {}", panic_message(&*payload)))
    })??;

    Ok(ResultItem { source, detections })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

pub(crate) fn record_prepare_failure(stats: &RunStats, source: &Path, e: &DetError) {
    RunStats::bump(&stats.decode_failures);
    tracing::warn!(source = %source.display(), error = %e, "skipping image");
}

pub(crate) fn record_inference_failure(stats: &RunStats, source: &Path, worker: usize, e: &DetError) {
    RunStats::bump(&stats.inference_failures);
    tracing::warn!(source = %source.display(), worker, error = %e, "inference failed");
}

/// Write one result file and count the outcome.
pub(crate) fn persist(stats: &RunStats, writer: &dyn ResultSink, item: &ResultItem) {
    match writer.persist(item) {
        Ok(path) => {
            RunStats::bump(&stats.written);
            tracing::trace!(
                path = %path.display(),
                detections = item.detections.len(),
                "wrote results"
            );
        }
        Err(e) => {
            RunStats::bump(&stats.write_failures);
            tracing::warn!(source = %item.source.display(), error = %e, "failed to write results");
        }
    }
}

/// Producer stage: prepare every source in order and enqueue it.
///
/// Sets `producer_done` on return, or on unwind.
pub(crate) fn run_producer<T: Transform + ?Sized>(
    ctx: &PipelineContext,
    transform: &T,
    sources: &[PathBuf],
    settings: &StageSettings,
) {
    let _finish = ctx.input.finish_on_drop(&ctx.producer_done);

    for (i, source) in sources.iter().enumerate() {
        settings.log_progress(i, sources.len());
        match prepare(&ctx.slabs, transform, source, settings) {
            Ok(item) => {
                let depth = ctx.input.push(item);
                RunStats::bump(&ctx.stats.enqueued);
                tracing::trace!(source = %source.display(), depth, "enqueued");
            }
            Err(e) => record_prepare_failure(&ctx.stats, source, &e),
        }
    }

    tracing::debug!(
        enqueued = RunStats::get(&ctx.stats.enqueued),
        failed = RunStats::get(&ctx.stats.decode_failures),
        "producer finished"
    );
}

/// Inference stage: hand each queued item to the worker pool.
///
/// Sets `inference_done` once the input queue is exhausted and every task
/// dispatched has completed.
pub(crate) fn run_inference<D: Detector + 'static>(
    ctx: &Arc<PipelineContext>,
    workers: &WorkerPool,
    shards: &Arc<DetectorShards<D>>,
) {
    let _finish = ctx.output.finish_on_drop(&ctx.inference_done);

    let mut dispatched = 0usize;
    while let Some(item) = ctx.input.pop_or_finish(|| ctx.producer_done.is_set()) {
        let task_ctx = Arc::clone(ctx);
        let task_shards = Arc::clone(shards);
        workers.run(move |worker| {
            let source = item.source.clone();
            match infer(&task_shards, worker, item) {
                Ok(result) => {
                    task_ctx.output.push(result);
                }
                Err(e) => record_inference_failure(&task_ctx.stats, &source, worker, &e),
            }
        });
        dispatched += 1;
    }

    workers.join();
    tracing::debug!(dispatched, "inference finished");
}

/// Writer stage: drain the output queue in batches until both upstream
/// stages are done and nothing is left.
///
/// With a saver pool each batch is spread over the pool and joined before
/// the next drain.
pub(crate) fn run_writer(
    ctx: &Arc<PipelineContext>,
    writer: &Arc<dyn ResultSink>,
    savers: Option<&WorkerPool>,
) {
    let mut batches = 0usize;
    while let Some(batch) = ctx.output.drain_or_finish(|| ctx.upstream_of_writer_done()) {
        batches += 1;
        tracing::trace!(items = batch.len(), "writing batch");
        match savers {
            None => {
                for item in &batch {
                    persist(&ctx.stats, &**writer, item);
                }
            }
            Some(pool) => {
                for item in batch {
                    let ctx = Arc::clone(ctx);
                    let writer = Arc::clone(writer);
                    pool.run(move |_| persist(&ctx.stats, &*writer, &item));
                }
                pool.join();
            }
        }
    }

    tracing::debug!(
        batches,
        written = RunStats::get(&ctx.stats.written),
        "writer finished"
    );
}
