// src/engine/resize.rs
//
// Preview downsampling: SIMD resize via fast_image_resize, image crate fallback.

use super::buffer::PixelBuffer;
use super::common::EngineResult;
use crate::error::MonotoneError;
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, RgbaImage};
use tracing::debug;

/// Pixel count above which an opacity scan pays for itself.
const OPAQUE_SCAN_THRESHOLD: u64 = 1_000_000;

/// Fit `(w, h)` inside a `max_dimension` square, keeping aspect ratio.
///
/// Returns the input unchanged when it already fits. Never returns a zero side.
pub fn preview_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || width == 0 || height == 0 {
        return (width, height);
    }
    let ratio = max_dimension as f64 / longest as f64;
    let scale = |side: u32| ((side as f64 * ratio).round() as u32).clamp(1, max_dimension);
    (scale(width), scale(height))
}

/// Shrink `buffer` so its longest side is at most `max_dimension`.
pub fn downsample_for_preview(buffer: PixelBuffer, max_dimension: u32) -> EngineResult<PixelBuffer> {
    if max_dimension == 0 {
        return Err(MonotoneError::invalid_argument(
            "preview_max_dimension",
            "0",
            "must be at least 1",
        ));
    }
    let (src_w, src_h) = buffer.dimensions();
    let (dst_w, dst_h) = preview_dimensions(src_w, src_h, max_dimension);
    if (dst_w, dst_h) == (src_w, src_h) {
        return Ok(buffer);
    }
    debug!(
        target: "monotone::resize",
        src_w, src_h, dst_w, dst_h, "downsampling for preview"
    );
    resize_rgba(buffer, dst_w, dst_h)
}

/// Lanczos3 resize of an RGBA buffer to exact dimensions.
pub fn resize_rgba(buffer: PixelBuffer, dst_width: u32, dst_height: u32) -> EngineResult<PixelBuffer> {
    let (src_width, src_height) = buffer.dimensions();
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(MonotoneError::resize_failed(
            (src_width, src_height),
            (dst_width, dst_height),
            "invalid dimensions for resize",
        ));
    }

    let mut src_pixels = buffer.into_raw();
    let primary = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        PixelType::U8x4,
    ) {
        Ok(src_image) => resize_with_source_image(src_image, dst_width, dst_height),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            copy_to_aligned_image(src_width, src_height, &src_pixels)
                .and_then(|aligned| resize_with_source_image(aligned, dst_width, dst_height))
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    let pixels = match primary {
        Ok(pixels) => pixels,
        Err(err) => {
            debug!(target: "monotone::resize", %err, "fir failed, using image crate fallback");
            resize_with_image_crate(src_pixels, src_width, src_height, dst_width, dst_height)
                .map_err(|fallback| {
                    MonotoneError::resize_failed(
                        (src_width, src_height),
                        (dst_width, dst_height),
                        format!("{err}; image crate fallback failed: {fallback}"),
                    )
                })?
        }
    };
    PixelBuffer::new(dst_width, dst_height, pixels)
}

fn copy_to_aligned_image(
    width: u32,
    height: u32,
    src_pixels: &[u8],
) -> Result<fir::images::Image<'static>, String> {
    let mut aligned = fir::images::Image::new(width, height, PixelType::U8x4);
    let dst = aligned.buffer_mut();
    if dst.len() != src_pixels.len() {
        return Err(format!(
            "fir alignment fallback buffer mismatch. expected {} bytes, got {} bytes",
            src_pixels.len(),
            dst.len()
        ));
    }
    dst.copy_from_slice(src_pixels);
    Ok(aligned)
}

fn is_fully_opaque(image: &fir::images::Image) -> bool {
    let pixels = image.width() as u64 * image.height() as u64;
    if pixels < OPAQUE_SCAN_THRESHOLD {
        return false;
    }
    image.buffer().iter().skip(3).step_by(4).all(|&a| a == 255)
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    dst_width: u32,
    dst_height: u32,
) -> Result<Vec<u8>, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, PixelType::U8x4);
    let premultiply = !is_fully_opaque(&src_image);

    let mul_div = MulDiv::default();
    if premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let options =
        ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3));
    fir::Resizer::new()
        .resize(&src_image, &mut dst_image, &options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }
    Ok(dst_image.into_vec())
}

fn resize_with_image_crate(
    src_pixels: Vec<u8>,
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Result<Vec<u8>, String> {
    let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels)
        .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
    Ok(image::imageops::resize(&rgba, dst_width, dst_height, FilterType::Lanczos3).into_raw())
}
