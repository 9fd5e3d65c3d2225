use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};

use detbatch_core::{tensor_len, DetError, Letterbox, RawImage, Result, Transform};

/// Grey value used for letterbox borders.
pub const LETTERBOX_FILL: u8 = 114;

/// Decode + letterbox + normalize transform backed by the `image` crate.
///
/// Output is planar RGB (`[3, H, W]`) with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    fill_value: u8,
    filter: FilterType,
}

impl ImageTransform {
    pub fn new() -> Self {
        Self {
            fill_value: LETTERBOX_FILL,
            filter: FilterType::Triangle,
        }
    }
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for ImageTransform {
    fn decode(&self, source: &Path) -> Result<RawImage> {
        crate::decode::decode_file(source)
    }

    fn transform(
        &self,
        image: &RawImage,
        target_width: u32,
        target_height: u32,
        fill: bool,
        out: &mut [f32],
    ) -> Result<Letterbox> {
        if image.channels != 3 {
            return Err(DetError::Transform(format!(
                "expected an RGB image, got {} channels",
                image.channels
            )));
        }
        let expected = tensor_len(target_width, target_height);
        if out.len() != expected {
            return Err(DetError::Transform(format!(
                "output buffer holds {} values, {target_width}x{target_height} needs {expected}",
                out.len()
            )));
        }

        let src = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(
            image.width,
            image.height,
            image.data.as_slice(),
        )
        .ok_or_else(|| {
            DetError::Transform(format!(
                "{} bytes is too small for a {}x{} RGB image",
                image.data.len(),
                image.width,
                image.height
            ))
        })?;

        let (letterbox, resized_w, resized_h) =
            compute_letterbox(image.width, image.height, target_width, target_height, fill)?;

        let pad = self.fill_value as f32 / 255.0;
        out.fill(pad);

        let plane = target_width as usize * target_height as usize;
        let mut write = |x: u32, y: u32, px: &Rgb<u8>| {
            let dx = x + letterbox.pad_left;
            let dy = y + letterbox.pad_top;
            if dx >= target_width || dy >= target_height {
                return;
            }
            let offset = dy as usize * target_width as usize + dx as usize;
            for (c, value) in px.0.iter().enumerate() {
                out[c * plane + offset] = *value as f32 / 255.0;
            }
        };

        if (resized_w, resized_h) == (image.width, image.height) {
            for (x, y, px) in src.enumerate_pixels() {
                write(x, y, px);
            }
        } else {
            let resized = imageops::resize(&src, resized_w, resized_h, self.filter);
            for (x, y, px) in resized.enumerate_pixels() {
                write(x, y, px);
            }
        }

        Ok(letterbox)
    }
}

/// Letterbox geometry for fitting `width × height` into the target size.
///
/// Returns the geometry and the size the image is resized to before padding.
/// With `fill` the image is stretched and never padded; otherwise it is scaled
/// uniformly and centred, and odd padding goes to the bottom/right edge.
pub fn compute_letterbox(
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
    fill: bool,
) -> Result<(Letterbox, u32, u32)> {
    if width == 0 || height == 0 || target_width == 0 || target_height == 0 {
        return Err(DetError::Transform(format!(
            "cannot letterbox {width}x{height} into {target_width}x{target_height}"
        )));
    }

    if fill {
        let lb = Letterbox::stretch(width, height, target_width, target_height);
        return Ok((lb, target_width, target_height));
    }

    let scale = (target_width as f64 / width as f64).min(target_height as f64 / height as f64);
    let dw = (target_width as f64 - scale * width as f64) / 2.0;
    let dh = (target_height as f64 - scale * height as f64) / 2.0;
    let round = |v: f64| v.round().max(0.0) as u32;

    let lb = Letterbox {
        scale_x: scale as f32,
        scale_y: scale as f32,
        pad_top: round(dh - 0.1),
        pad_bottom: round(dh + 0.1),
        pad_left: round(dw - 0.1),
        pad_right: round(dw + 0.1),
    };
    let resized_w = ((width as f64 * scale) as u32).clamp(1, target_width);
    let resized_h = ((height as f64 * scale) as u32).clamp(1, target_height);

    Ok((lb, resized_w, resized_h))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: u32, height: u32) -> RawImage {
        let mut img = RawImage::filled(width, height, 0);
        for (i, px) in img.data.chunks_mut(3).enumerate() {
            if i % 2 == 0 {
                px.copy_from_slice(&[255, 128, 0]);
            }
        }
        img
    }

    #[test]
    fn stretch_has_no_padding() {
        let (lb, w, h) = compute_letterbox(1280, 720, 640, 640, true).unwrap();
        assert_eq!((w, h), (640, 640));
        assert_eq!((lb.pad_top, lb.pad_bottom, lb.pad_left, lb.pad_right), (0, 0, 0, 0));
        assert!((lb.scale_x - 0.5).abs() < 1e-6);
        assert!((lb.scale_y - 640.0 / 720.0).abs() < 1e-6);
    }

    #[test]
    fn letterbox_centres_wide_image() {
        let (lb, w, h) = compute_letterbox(1280, 720, 640, 640, false).unwrap();
        assert_eq!((w, h), (640, 360));
        assert_eq!(lb.scale_x, 0.5);
        assert_eq!((lb.pad_left, lb.pad_right), (0, 0));
        assert_eq!((lb.pad_top, lb.pad_bottom), (140, 140));
    }

    #[test]
    fn odd_padding_goes_bottom_right() {
        // 1 px of slack vertically: 0.5 rounds down on top, up on bottom.
        let (lb, _, h) = compute_letterbox(4, 3, 4, 4, false).unwrap();
        assert_eq!(h, 3);
        assert_eq!((lb.pad_top, lb.pad_bottom), (0, 1));
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(compute_letterbox(0, 10, 640, 640, true).is_err());
        assert!(compute_letterbox(10, 10, 0, 640, false).is_err());
    }

    #[test]
    fn identity_transform_is_planar_and_normalized() {
        let img = checker(2, 2);
        let mut out = vec![0.0; tensor_len(2, 2)];
        let lb = ImageTransform::new()
            .transform(&img, 2, 2, true, &mut out)
            .unwrap();
        assert_eq!(lb.scale_x, 1.0);

        // R plane, then G plane, then B plane.
        assert_eq!(&out[0..4], &[1.0, 0.0, 1.0, 0.0]);
        assert!((out[4] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(&out[8..12], &[0.0; 4]);
    }

    #[test]
    fn padding_uses_fill_value() {
        let img = RawImage::filled(4, 2, 255);
        let mut out = vec![0.0; tensor_len(4, 4)];
        let lb = ImageTransform::new()
            .transform(&img, 4, 4, false, &mut out)
            .unwrap();
        assert_eq!((lb.pad_top, lb.pad_bottom), (1, 1));

        let pad = LETTERBOX_FILL as f32 / 255.0;
        // Top row of the R plane is padding, the next row is image.
        assert!(out[0..4].iter().all(|v| (*v - pad).abs() < 1e-6));
        assert!(out[4..8].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(out[12..16].iter().all(|v| (*v - pad).abs() < 1e-6));
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        let img = RawImage::filled(8, 8, 10);
        let mut out = vec![0.0; 10];
        let err = ImageTransform::new()
            .transform(&img, 4, 4, true, &mut out)
            .unwrap_err();
        assert!(matches!(err, DetError::Transform(_)));
    }

    #[test]
    fn transform_is_deterministic() {
        let img = checker(37, 21);
        let t = ImageTransform::new();
        let mut a = vec![0.0; tensor_len(16, 16)];
        let mut b = vec![1.0; tensor_len(16, 16)];
        t.transform(&img, 16, 16, false, &mut a).unwrap();
        t.transform(&img, 16, 16, false, &mut b).unwrap();
        assert_eq!(a, b);
    }
}
