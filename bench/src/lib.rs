//! Fixtures shared by the benchmarks: synthetic images and a detector that
//! stands in for model latency.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use detbatch_core::{BBox, Detection, Detector, ImageGeometry, Result};

/// Write `count` gradient PNGs of `width x height` into `dir`.
pub fn write_pngs(dir: &Path, count: usize, width: u32, height: u32) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let img = RgbImage::from_fn(width, height, |x, y| {
                Rgb([(x % 256) as u8, (y % 256) as u8, (i % 256) as u8])
            });
            let path = dir.join(format!("bench_{i:04}.png"));
            img.save(&path)
                .unwrap_or_else(|e| panic!("writing {}: {e}", path.display()));
            path
        })
        .collect()
}

/// Spins for a fixed time per call and reports one box.
///
/// Spinning rather than sleeping keeps a core busy the way real inference does.
pub struct SpinDetector {
    latency: Duration,
}

impl SpinDetector {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Detector for SpinDetector {
    fn name(&self) -> &str {
        "spin"
    }

    fn detect(&mut self, tensor: &[f32], geometry: &ImageGeometry) -> Result<Vec<Detection>> {
        let start = Instant::now();
        let mut acc = 0.0f32;
        let mut i = 0usize;
        while start.elapsed() < self.latency {
            acc = acc * 0.5 + tensor.get(i % tensor.len().max(1)).copied().unwrap_or(0.0);
            i = i.wrapping_add(7919);
            std::hint::black_box(acc);
        }
        Ok(vec![Detection {
            bbox: BBox::new(
                0.0,
                0.0,
                geometry.original_width as f32 / 2.0,
                geometry.original_height as f32 / 2.0,
            ),
            score: 0.9,
            class_id: 0,
        }])
    }
}
