use std::path::Path;

use ort::session::Session;
use ort::value::Tensor;

use detbatch_core::{DetError, Detection, Detector, ImageGeometry, Result};

use crate::postprocess::DetectionPostprocessor;

/// RT-DETR detector running on ONNX Runtime.
///
/// Expects a single `[1, 3, H, W]` float input and a `[1, queries, 4 + classes]`
/// output. One instance per thread: `Session::run` needs exclusive access.
pub struct OnnxDetector {
    session: Session,
    postprocessor: DetectionPostprocessor,
}

impl OnnxDetector {
    /// Load the model at `model_path`, keeping detections scoring at least
    /// `confidence_threshold`.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self> {
        let model_err = |e: ort::Error| DetError::ModelLoad(format!("{}: {e}", model_path.display()));

        let builder = Session::builder().map_err(model_err)?;
        let builder = builder.with_intra_threads(1).map_err(model_err)?;
        let session = builder.commit_from_file(model_path).map_err(model_err)?;

        tracing::info!(
            model = %model_path.display(),
            threshold = confidence_threshold,
            "loaded ONNX detector"
        );

        Ok(Self {
            session,
            postprocessor: DetectionPostprocessor::new().with_threshold(confidence_threshold),
        })
    }
}

impl Detector for OnnxDetector {
    fn name(&self) -> &str {
        "onnx-rtdetr"
    }

    fn detect(&mut self, tensor: &[f32], geometry: &ImageGeometry) -> Result<Vec<Detection>> {
        let infer_err = |e: ort::Error| DetError::Inference(e.to_string());

        let shape = [
            1usize,
            3,
            geometry.input_height as usize,
            geometry.input_width as usize,
        ];
        let input = Tensor::from_array((shape, tensor.to_vec().into_boxed_slice()))
            .map_err(infer_err)?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(infer_err)?;
        let (out_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(infer_err)?;

        if out_shape.len() != 3 {
            return Err(DetError::Inference(format!(
                "expected a [batch, queries, 4 + classes] output, got {out_shape:?}"
            )));
        }
        let num_queries = out_shape[1].max(0) as usize;

        self.postprocessor
            .extract_detections(data, num_queries, geometry)
    }
}
