//! Decodes and normalizes the image carried by a task payload before it
//! reaches the recognition engine: base64/file source, optional region crop,
//! optional longest-side downscale.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{imageops::FilterType, DynamicImage};

use crate::protocol::{FailureKind, OcrRequest, TaskFailure};

/// Resolve the image source and decode it.
///
/// Base64 data takes precedence over `image_path` when both are present; a
/// request with neither is rejected here (the HTTP boundary checks too, but
/// the worker never trusts its input).
pub fn decode_payload(request: &OcrRequest) -> Result<DynamicImage, TaskFailure> {
    if let Some(b64) = request.image_base64.as_deref() {
        // Tolerate data-URL style prefixes ("data:image/png;base64,....").
        let b64 = match b64.split_once(',') {
            Some((_, rest)) => rest,
            None => b64,
        };
        let bytes = BASE64
            .decode(b64)
            .map_err(|e| TaskFailure::new(FailureKind::Decode, format!("invalid base64: {e}")))?;
        return image::load_from_memory(&bytes)
            .map_err(|e| TaskFailure::new(FailureKind::Decode, format!("undecodable image: {e}")));
    }

    if let Some(path) = request.image_path.as_deref() {
        if !std::path::Path::new(path).exists() {
            return Err(TaskFailure::new(
                FailureKind::NotFound,
                format!("file not found: {path}"),
            ));
        }
        return image::open(path)
            .map_err(|e| TaskFailure::new(FailureKind::Decode, format!("undecodable image: {e}")));
    }

    Err(TaskFailure::new(FailureKind::Decode, "no image provided"))
}

/// Apply the optional region crop and `max_side` downscale.
pub fn crop_and_resize(
    mut img: DynamicImage,
    request: &OcrRequest,
) -> Result<DynamicImage, TaskFailure> {
    if let Some([x, y, w, h]) = request.region {
        let (img_w, img_h) = (img.width() as i64, img.height() as i64);
        let x = x.max(0);
        let y = y.max(0);
        let w = w.min(img_w - x);
        let h = h.min(img_h - y);
        if w <= 0 || h <= 0 {
            return Err(TaskFailure::new(FailureKind::Decode, "invalid region"));
        }
        img = img.crop_imm(x as u32, y as u32, w as u32, h as u32);
    }

    if let Some(max_side) = request.max_side {
        if max_side > 0 {
            let longest = img.width().max(img.height());
            if longest > max_side {
                let scale = max_side as f64 / longest as f64;
                let new_w = ((img.width() as f64 * scale) as u32).max(1);
                let new_h = ((img.height() as f64 * scale) as u32).max(1);
                img = img.resize_exact(new_w, new_h, FilterType::Triangle);
            }
        }
    }

    Ok(img)
}
