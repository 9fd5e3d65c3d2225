use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use detbatch_core::{Detection, ImageGeometry};
use detbatch_pool::{SlabLease, SlabPool};

use crate::queue::{CompletionFlag, WorkQueue};

/// A preprocessed image waiting for inference.
///
/// The slab returns to the pool when the item (or just `buffer`) is dropped.
#[derive(Debug)]
pub struct WorkItem {
    /// Planar model-input tensor.
    pub buffer: SlabLease<f32>,
    pub source: PathBuf,
    /// Original size plus the letterbox used to build `buffer`.
    pub geometry: ImageGeometry,
}

/// Detections for one image, waiting to be written.
#[derive(Debug, Clone)]
pub struct ResultItem {
    pub source: PathBuf,
    pub detections: Vec<Detection>,
}

/// Per-run counters, updated from every stage.
#[derive(Debug, Default)]
pub struct RunStats {
    pub enqueued: AtomicUsize,
    pub written: AtomicUsize,
    pub decode_failures: AtomicUsize,
    pub inference_failures: AtomicUsize,
    pub write_failures: AtomicUsize,
}

impl RunStats {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

/// State shared by the stages of one pipelined run.
///
/// Created per run and dropped once every stage has returned, at which point
/// both queues are empty and every slab is back in `slabs`.
#[derive(Debug)]
pub struct PipelineContext {
    /// Producer -> inference.
    pub input: WorkQueue<WorkItem>,
    /// Inference -> writer.
    pub output: WorkQueue<ResultItem>,
    /// Set (under the `input` lock) after the last item is enqueued.
    pub producer_done: CompletionFlag,
    /// Set (under the `output` lock) after every inference task has finished.
    pub inference_done: CompletionFlag,
    pub slabs: Arc<SlabPool<f32>>,
    pub stats: RunStats,
}

impl PipelineContext {
    pub fn new(slabs: Arc<SlabPool<f32>>) -> Self {
        Self {
            input: WorkQueue::new("input"),
            output: WorkQueue::new("output"),
            producer_done: CompletionFlag::new("producer_done"),
            inference_done: CompletionFlag::new("inference_done"),
            slabs,
            stats: RunStats::default(),
        }
    }

    /// The writer's termination condition.
    ///
    /// `inference_done` is only set after `producer_done` and after the input
    /// queue has drained, so both flags together mean nothing else can reach
    /// the output queue.
    pub fn upstream_of_writer_done(&self) -> bool {
        self.producer_done.is_set() && self.inference_done.is_set()
    }
}
