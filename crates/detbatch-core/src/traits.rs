use std::path::Path;

use crate::error::Result;
use crate::types::{Detection, ImageGeometry, Letterbox, RawImage};

/// Turns an image file into a model input tensor.
///
/// Implementations must be deterministic and must only write into the
/// caller-supplied `out` buffer; a single instance is shared by reference
/// across threads.
pub trait Transform: Send + Sync {
    /// Decode the file at `source` into an RGB8 image.
    fn decode(&self, source: &Path) -> Result<RawImage>;

    /// Resize/pad `image` to `target_width × target_height`, normalize it and
    /// write the planar CHW tensor into `out`.
    ///
    /// With `fill` set the image is stretched to the target size; otherwise
    /// the aspect ratio is kept and the borders are padded.
    fn transform(
        &self,
        image: &RawImage,
        target_width: u32,
        target_height: u32,
        fill: bool,
        out: &mut [f32],
    ) -> Result<Letterbox>;
}

/// An inference engine instance.
///
/// A detector is not required to tolerate concurrent calls: the pipeline
/// gives every worker thread its own instance and only ever calls it from
/// that worker.
pub trait Detector: Send {
    /// Human-readable name for tracing.
    fn name(&self) -> &str {
        "detector"
    }

    /// Run inference on a preprocessed tensor and return detections in
    /// original-image coordinates, in model output order.
    fn detect(&mut self, tensor: &[f32], geometry: &ImageGeometry) -> Result<Vec<Detection>>;
}
