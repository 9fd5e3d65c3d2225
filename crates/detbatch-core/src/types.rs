use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates, `(x, y)` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates `(x1, y1)`-`(x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// The four corners clockwise from top-left.
    pub fn corners(&self) -> [(f32, f32); 4] {
        [
            (self.x, self.y),
            (self.right(), self.y),
            (self.right(), self.bottom()),
            (self.x, self.bottom()),
        ]
    }
}

/// One detected object in original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub class_id: u32,
}

/// Decoded RGB8 image before it is transformed into a model tensor.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawImage {
    /// Solid-colour RGB image, mostly useful for warmup and tests.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            data: vec![value; (width * height * 3) as usize],
            width,
            height,
            channels: 3,
        }
    }
}

/// Geometry produced by the letterbox transform.
///
/// `scale_*` map original pixels to model-input pixels; the padding is the
/// constant border added around the resized image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Letterbox {
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pad_left: u32,
    pub pad_right: u32,
}

impl Letterbox {
    /// Pure stretch from `(width, height)` to `(target_width, target_height)`.
    pub fn stretch(width: u32, height: u32, target_width: u32, target_height: u32) -> Self {
        Self {
            scale_x: target_width as f32 / width as f32,
            scale_y: target_height as f32 / height as f32,
            pad_top: 0,
            pad_bottom: 0,
            pad_left: 0,
            pad_right: 0,
        }
    }

    /// Map a point in model-input pixels back to original-image pixels.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_left as f32) / self.scale_x,
            (y - self.pad_top as f32) / self.scale_y,
        )
    }
}

/// Everything a detector needs to know about the image behind a tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageGeometry {
    pub original_width: u32,
    pub original_height: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub letterbox: Letterbox,
}

impl ImageGeometry {
    /// Geometry for a tensor that was produced by stretching the whole image.
    pub fn stretched(original_width: u32, original_height: u32, input_width: u32, input_height: u32) -> Self {
        Self {
            original_width,
            original_height,
            input_width,
            input_height,
            letterbox: Letterbox::stretch(original_width, original_height, input_width, input_height),
        }
    }

    /// Number of `f32` elements in a planar CHW RGB tensor for this input size.
    pub fn tensor_len(&self) -> usize {
        tensor_len(self.input_width, self.input_height)
    }
}

/// Number of `f32` elements in a planar CHW RGB tensor of `width × height`.
pub fn tensor_len(width: u32, height: u32) -> usize {
    3 * width as usize * height as usize
}
