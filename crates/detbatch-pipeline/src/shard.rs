use std::sync::Arc;

use parking_lot::Mutex;

use detbatch_core::{DetError, Detection, Detector, ImageGeometry, Result};
use detbatch_pool::WorkerPool;

/// One detector per inference worker, indexed by worker identity.
///
/// Shard `i` is built on worker `i` and only ever used by tasks running on
/// worker `i`, so its lock is never contended. The lock exists to turn a
/// violation of that rule into [`DetError::ShardUnavailable`] instead of
/// shared mutable access.
pub struct DetectorShards<D> {
    shards: Vec<Mutex<D>>,
}

impl<D: Detector + 'static> DetectorShards<D> {
    /// Build one shard per worker of `pool`, calling `factory(identity)` on
    /// that worker's own thread.
    ///
    /// Fails with the first factory error, or if a factory panicked.
    pub fn build<F>(pool: &WorkerPool, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<D> + Send + Sync + 'static,
    {
        let size = pool.size();
        let slots: Arc<Mutex<Vec<Option<Result<D>>>>> =
            Arc::new(Mutex::new((0..size).map(|_| None).collect()));

        let results = Arc::clone(&slots);
        pool.broadcast(move |identity| {
            let built = factory(identity);
            results.lock()[identity] = Some(built);
        });

        let built = std::mem::take(&mut *slots.lock());
        let mut shards = Vec::with_capacity(size);
        for (identity, slot) in built.into_iter().enumerate() {
            match slot {
                Some(Ok(detector)) => shards.push(Mutex::new(detector)),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(DetError::ModelLoad(format!(
                        "detector shard {identity} was not constructed (factory panicked)"
                    )))
                }
            }
        }

        tracing::info!(
            pool = pool.name(),
            shards = shards.len(),
            detector = %shards.first().map(|s| s.lock().name().to_string()).unwrap_or_default(),
            "detector shards ready"
        );
        Ok(Self { shards })
    }
}

impl<D: Detector> DetectorShards<D> {
    /// Wrap detectors built elsewhere; shard `i` is `detectors[i]`.
    pub fn from_detectors(detectors: Vec<D>) -> Self {
        Self {
            shards: detectors.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Run shard `worker` on one tensor.
    pub fn detect(
        &self,
        worker: usize,
        tensor: &[f32],
        geometry: &ImageGeometry,
    ) -> Result<Vec<Detection>> {
        let shard = self
            .shards
            .get(worker)
            .ok_or(DetError::ShardUnavailable { worker })?;
        let mut detector = shard
            .try_lock()
            .ok_or(DetError::ShardUnavailable { worker })?;
        detector.detect(tensor, geometry)
    }

    /// Exclusive access to every shard, for inspection after a run.
    pub fn for_each(&self, mut f: impl FnMut(usize, &mut D)) {
        for (worker, shard) in self.shards.iter().enumerate() {
            f(worker, &mut shard.lock());
        }
    }
}

impl<D> std::fmt::Debug for DetectorShards<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorShards")
            .field("shards", &self.shards.len())
            .finish()
    }
}
