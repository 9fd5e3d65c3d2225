use detbatch_core::{BBox, DetError, Detection, ImageGeometry, Result};

/// Turns raw RT-DETR style output into detections.
///
/// The model emits one row per query: normalized `cx, cy, w, h` followed by
/// one score per class. Each query contributes at most one detection (its
/// best class), so no NMS is needed.
#[derive(Debug, Clone)]
pub struct DetectionPostprocessor {
    /// Minimum best-class score for a query to be kept.
    confidence_threshold: f32,
    /// Cap on detections per image. `None` keeps all.
    max_detections: Option<usize>,
}

impl DetectionPostprocessor {
    pub fn new() -> Self {
        Self {
            confidence_threshold: 0.5,
            max_detections: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_max_detections(mut self, max: usize) -> Self {
        self.max_detections = Some(max);
        self
    }

    /// Decode `num_queries` rows of `raw` into detections in original-image
    /// pixels. Query order is preserved.
    pub fn extract_detections(
        &self,
        raw: &[f32],
        num_queries: usize,
        geometry: &ImageGeometry,
    ) -> Result<Vec<Detection>> {
        if num_queries == 0 {
            return Ok(Vec::new());
        }
        let row = raw.len() / num_queries;
        if row <= 4 || row * num_queries != raw.len() {
            return Err(DetError::Inference(format!(
                "output of {} values does not split into {num_queries} query rows",
                raw.len()
            )));
        }

        let max_x = geometry.original_width as f32 - 1.0;
        let max_y = geometry.original_height as f32 - 1.0;
        let in_w = geometry.input_width as f32;
        let in_h = geometry.input_height as f32;
        let lb = &geometry.letterbox;

        let mut detections = Vec::new();
        for query in raw.chunks_exact(row) {
            let (class_id, score) = best_class(&query[4..]);
            if score < self.confidence_threshold {
                continue;
            }

            let (cx, cy, w, h) = (query[0], query[1], query[2], query[3]);
            let (x1, y1) = lb.unmap((cx - w / 2.0) * in_w, (cy - h / 2.0) * in_h);
            let (x2, y2) = lb.unmap((cx + w / 2.0) * in_w, (cy + h / 2.0) * in_h);

            let bbox = BBox::from_corners(
                x1.clamp(0.0, max_x),
                y1.clamp(0.0, max_y),
                x2.clamp(0.0, max_x),
                y2.clamp(0.0, max_y),
            );
            if bbox.width <= 0.0 || bbox.height <= 0.0 {
                continue;
            }

            detections.push(Detection {
                bbox,
                score,
                class_id,
            });
            if self.max_detections.is_some_and(|max| detections.len() >= max) {
                break;
            }
        }

        tracing::trace!(
            queries = num_queries,
            kept = detections.len(),
            threshold = self.confidence_threshold,
            "decoded detections"
        );

        Ok(detections)
    }
}

impl Default for DetectionPostprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Arg-max over class scores. Scores must beat the running best strictly,
/// starting from zero, so an all-zero row maps to class 0 with score 0.
fn best_class(scores: &[f32]) -> (u32, f32) {
    let mut best = (0u32, 0.0f32);
    for (class_id, &score) in scores.iter().enumerate() {
        if score > best.1 {
            best = (class_id as u32, score);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use detbatch_core::Letterbox;

    fn geometry(w: u32, h: u32) -> ImageGeometry {
        ImageGeometry::stretched(w, h, 640, 640)
    }

    #[test]
    fn decodes_and_scales_to_original() {
        // One query centred in the image covering half of each dimension.
        let raw = [0.5, 0.5, 0.5, 0.5, 0.1, 0.9, 0.2];
        let dets = DetectionPostprocessor::new()
            .with_threshold(0.5)
            .extract_detections(&raw, 1, &geometry(200, 100))
            .unwrap();

        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!(d.class_id, 1);
        assert!((d.score - 0.9).abs() < 1e-6);
        assert!((d.bbox.x - 50.0).abs() < 1e-3);
        assert!((d.bbox.y - 25.0).abs() < 1e-3);
        assert!((d.bbox.width - 100.0).abs() < 1e-3);
        assert!((d.bbox.height - 50.0).abs() < 1e-3);
    }

    #[test]
    fn threshold_is_inclusive_and_order_kept() {
        let raw = [
            0.2, 0.2, 0.1, 0.1, 0.5, 0.0, //
            0.8, 0.8, 0.1, 0.1, 0.0, 0.49, //
            0.5, 0.5, 0.1, 0.1, 0.0, 0.7,
        ];
        let dets = DetectionPostprocessor::new()
            .with_threshold(0.5)
            .extract_detections(&raw, 3, &geometry(100, 100))
            .unwrap();
        let classes: Vec<u32> = dets.iter().map(|d| d.class_id).collect();
        assert_eq!(classes, vec![0, 1]);
        assert!(dets[0].bbox.x < dets[1].bbox.x);
    }

    #[test]
    fn boxes_are_clamped_and_degenerate_dropped() {
        let raw = [
            0.0, 0.0, 0.4, 0.4, 0.9, // spills off the top-left corner
            1.5, 1.5, 0.2, 0.2, 0.9, // entirely outside: collapses to a point
        ];
        let dets = DetectionPostprocessor::new()
            .extract_detections(&raw, 2, &geometry(100, 100))
            .unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox.x, 0.0);
        assert_eq!(dets[0].bbox.y, 0.0);
        assert!((dets[0].bbox.right() - 20.0).abs() < 1e-3);
    }

    #[test]
    fn undoes_letterbox_padding() {
        // 200x100 letterboxed into 200x200: scale 1, 50 px of padding on top.
        let geometry = ImageGeometry {
            original_width: 200,
            original_height: 100,
            input_width: 200,
            input_height: 200,
            letterbox: Letterbox {
                scale_x: 1.0,
                scale_y: 1.0,
                pad_top: 50,
                pad_bottom: 50,
                pad_left: 0,
                pad_right: 0,
            },
        };
        let raw = [0.5, 0.5, 0.2, 0.2, 0.8];
        let dets = DetectionPostprocessor::new()
            .extract_detections(&raw, 1, &geometry)
            .unwrap();
        assert!((dets[0].bbox.x - 80.0).abs() < 1e-3);
        assert!((dets[0].bbox.y - 30.0).abs() < 1e-3);
        assert!((dets[0].bbox.height - 40.0).abs() < 1e-3);
    }

    #[test]
    fn max_detections_caps_output() {
        let raw: Vec<f32> = (0..10)
            .flat_map(|_| [0.5, 0.5, 0.2, 0.2, 0.9])
            .collect();
        let dets = DetectionPostprocessor::new()
            .with_max_detections(3)
            .extract_detections(&raw, 10, &geometry(64, 64))
            .unwrap();
        assert_eq!(dets.len(), 3);
    }

    #[test]
    fn malformed_output_is_an_error() {
        let err = DetectionPostprocessor::new()
            .extract_detections(&[0.0; 9], 2, &geometry(10, 10))
            .unwrap_err();
        assert!(matches!(err, DetError::Inference(_)));
    }
}
