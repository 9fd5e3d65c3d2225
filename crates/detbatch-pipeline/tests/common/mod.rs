//! Stand-in transform and detector for exercising the pipeline without a
//! model or real images.
//!
//! An "image" is a text file holding `<width> <height>`. The transform fills
//! the tensor with the width, and the detector reports one box covering the
//! top-left quarter of the image, so every result file can be checked
//! against its source.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use detbatch_core::{
    BBox, DetError, Detection, Detector, ImageGeometry, Letterbox, RawImage, Result, Transform,
};
use detbatch_pipeline::{ExecutionMode, PipelineConfig, ResultItem, ResultSink, ResultWriter};

/// Width that makes decoding panic.
pub const DECODE_PANIC_WIDTH: u32 = 7;
/// Width that makes the transform panic while it holds a slab.
pub const TRANSFORM_PANIC_WIDTH: u32 = 11;
/// Width that makes the transform fail after the slab has been leased.
pub const TRANSFORM_FAIL_WIDTH: u32 = 13;
/// Width that makes the detector return an error.
pub const DETECT_FAIL_WIDTH: u32 = 17;
/// Width that makes the detector panic.
pub const DETECT_PANIC_WIDTH: u32 = 19;

pub struct StubTransform {
    max_delay_us: u64,
    rng: Mutex<ChaCha8Rng>,
}

impl StubTransform {
    pub fn new() -> Self {
        Self::with_delays(0, 0)
    }

    /// Sleep a random `0..max_delay_us` in each call.
    pub fn with_delays(max_delay_us: u64, seed: u64) -> Self {
        Self {
            max_delay_us,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    fn pause(&self) {
        if self.max_delay_us > 0 {
            let us = self.rng.lock().unwrap().gen_range(0..self.max_delay_us);
            std::thread::sleep(Duration::from_micros(us));
        }
    }
}

impl Transform for StubTransform {
    fn decode(&self, source: &Path) -> Result<RawImage> {
        self.pause();
        let text = std::fs::read_to_string(source)?;
        let mut dims = text.split_whitespace().map(str::parse::<u32>);
        match (dims.next(), dims.next()) {
            (Some(Ok(DECODE_PANIC_WIDTH)), _) => panic!("stub decoder crashed"),
            (Some(Ok(width)), Some(Ok(height))) if width > 0 && height > 0 => {
                Ok(RawImage::filled(width, height, 0))
            }
            _ => Err(DetError::ImageDecode(format!(
                "{}: not a stub image",
                source.display()
            ))),
        }
    }

    fn transform(
        &self,
        image: &RawImage,
        target_width: u32,
        target_height: u32,
        _fill: bool,
        out: &mut [f32],
    ) -> Result<Letterbox> {
        if image.width == TRANSFORM_FAIL_WIDTH {
            return Err(DetError::Transform("unsupported width".into()));
        }
        if image.width == TRANSFORM_PANIC_WIDTH {
            out.fill(-1.0);
            panic!("stub transform crashed");
        }
        out.fill(image.width as f32);
        Ok(Letterbox::stretch(
            image.width,
            image.height,
            target_width,
            target_height,
        ))
    }
}

pub struct StubDetector {
    pub worker: usize,
    pub calls: usize,
    /// Thread each call ran on.
    pub threads: Vec<Option<String>>,
    max_delay_us: u64,
    rng: ChaCha8Rng,
    total_calls: Arc<AtomicUsize>,
}

impl StubDetector {
    pub fn new(worker: usize) -> Self {
        Self::with_delays(worker, 0, 0, Arc::new(AtomicUsize::new(0)))
    }

    pub fn with_delays(
        worker: usize,
        max_delay_us: u64,
        seed: u64,
        total_calls: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            worker,
            calls: 0,
            threads: Vec::new(),
            max_delay_us,
            rng: ChaCha8Rng::seed_from_u64(seed ^ ((worker as u64) << 32)),
            total_calls,
        }
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &str {
        "stub"
    }

    fn detect(&mut self, tensor: &[f32], geometry: &ImageGeometry) -> Result<Vec<Detection>> {
        self.calls += 1;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.threads
            .push(std::thread::current().name().map(str::to_owned));
        if self.max_delay_us > 0 {
            let us = self.rng.gen_range(0..self.max_delay_us);
            std::thread::sleep(Duration::from_micros(us));
        }

        let width = tensor.first().copied().unwrap_or(0.0) as u32;
        if width == DETECT_FAIL_WIDTH {
            return Err(DetError::Inference("stub detector refused".into()));
        }
        if width == DETECT_PANIC_WIDTH {
            panic!("stub detector crashed");
        }
        Ok(vec![expected_detection(
            geometry.original_width,
            geometry.original_height,
        )])
    }
}

/// File-backed sink that sleeps a random `0..max_delay_us` before each write.
pub struct SlowSink {
    inner: ResultWriter,
    max_delay_us: u64,
    rng: Mutex<ChaCha8Rng>,
    writes: Arc<AtomicUsize>,
}

impl SlowSink {
    /// `writes` counts every persist call across sinks sharing it.
    pub fn new(output_dir: &Path, max_delay_us: u64, seed: u64, writes: Arc<AtomicUsize>) -> Self {
        Self {
            inner: ResultWriter::new(output_dir).unwrap(),
            max_delay_us,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            writes,
        }
    }
}

impl ResultSink for SlowSink {
    fn persist(&self, item: &ResultItem) -> Result<PathBuf> {
        if self.max_delay_us > 0 {
            let us = self.rng.lock().unwrap().gen_range(0..self.max_delay_us);
            std::thread::sleep(Duration::from_micros(us));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.persist(item)
    }
}

/// The detection the stub reports for a `width x height` image.
pub fn expected_detection(width: u32, height: u32) -> Detection {
    Detection {
        bbox: BBox::new(0.0, 0.0, width as f32 / 2.0, height as f32 / 2.0),
        score: 0.9,
        class_id: width % 5,
    }
}

/// Write a stub image and return its path.
pub fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, format!("{width} {height}")).unwrap();
    path
}

/// `count` valid stub images named `img_000.jpg`, ...
pub fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let width = 20 + i as u32;
            write_image(dir, &format!("img_{i:03}.jpg"), width, width + 10)
        })
        .collect()
}

/// Small tensors and no progress noise.
pub fn test_config(output_dir: &Path, mode: ExecutionMode, workers: usize) -> PipelineConfig {
    PipelineConfig {
        workers,
        pool_capacity_multiplier: 2,
        mode,
        output_dir: output_dir.to_path_buf(),
        input_width: 8,
        input_height: 8,
        backoff_ms: 1,
        progress_every: 0,
        ..Default::default()
    }
}
