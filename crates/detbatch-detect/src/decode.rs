use std::path::Path;

use detbatch_core::{DetError, RawImage, Result};

/// Decode an image file (JPEG, PNG, BMP, TIFF, WebP) into RGB8.
pub fn decode_file(path: &Path) -> Result<RawImage> {
    let img = image::open(path)
        .map_err(|e| DetError::ImageDecode(format!("{}: {e}", path.display())))?;
    Ok(to_raw(img))
}

/// Decode in-memory image bytes into RGB8.
pub fn decode_bytes(data: &[u8]) -> Result<RawImage> {
    let img =
        image::load_from_memory(data).map_err(|e| DetError::ImageDecode(e.to_string()))?;
    Ok(to_raw(img))
}

fn to_raw(img: image::DynamicImage) -> RawImage {
    let rgb = img.to_rgb8();
    RawImage {
        width: rgb.width(),
        height: rgb.height(),
        channels: 3,
        data: rgb.into_raw(),
    }
}
