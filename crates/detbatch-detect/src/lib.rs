pub mod decode;
#[cfg(feature = "onnx")]
pub mod engine;
pub mod letterbox;
pub mod postprocess;

pub use decode::{decode_bytes, decode_file};
#[cfg(feature = "onnx")]
pub use engine::OnnxDetector;
pub use letterbox::{compute_letterbox, ImageTransform, LETTERBOX_FILL};
pub use postprocess::DetectionPostprocessor;
