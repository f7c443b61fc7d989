// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune-png), WebP (libwebp), others via image.
// Everything lands as an upright RGBA8 PixelBuffer.

use super::buffer::PixelBuffer;
use super::common::{run_with_panic_policy, EngineResult};
use super::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::MonotoneError;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use tracing::debug;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo)
pub fn decode_jpeg_mozjpeg(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(MonotoneError::decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            MonotoneError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;
        let mut decompress = decompress.rgb().map_err(|e| {
            MonotoneError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = u32::try_from(decompress.width())
            .map_err(|_| MonotoneError::dimension_exceeds_limit(u32::MAX, MAX_DIMENSION))?;
        let height = u32::try_from(decompress.height())
            .map_err(|_| MonotoneError::dimension_exceeds_limit(u32::MAX, MAX_DIMENSION))?;
        check_dimensions(width, height)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            MonotoneError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat: Vec<u8> = pixels.into_iter().flatten().collect();

        RgbImage::from_raw(width, height, flat)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| MonotoneError::decode_failed("mozjpeg: truncated scanline data"))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        let mut decoder = PngDecoder::new_with_options(Cursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| MonotoneError::decode_failed(format!("png: decode failed: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| MonotoneError::decode_failed("png: missing header info"))?;
        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(MonotoneError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| MonotoneError::decode_failed("png: missing colorspace"))?;

        let built = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
            ColorSpace::RGBA => {
                RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
            }
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8),
            ColorSpace::LumaA => {
                GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
            }
            other => {
                return Err(MonotoneError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };
        built.ok_or_else(|| MonotoneError::decode_failed("png: pixel data does not match header"))
    })
}

/// Decode WebP using libwebp. Animated files fall back to the image crate (first frame).
pub fn decode_webp_libwebp(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Header first, so malformed files never size an allocation
        let features = BitstreamFeatures::new(data)
            .ok_or_else(|| MonotoneError::decode_failed("webp: failed to read bitstream features"))?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            return image::load_from_memory(data).map_err(|e| {
                MonotoneError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| MonotoneError::decode_failed("webp: decode failed"))?;
        check_dimensions(decoded.width(), decoded.height())?;
        Ok(decoded.to_image())
    })
}

/// Decode the remaining formats the image crate is built with.
pub fn decode_with_image_crate(data: &[u8]) -> EngineResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        ensure_dimensions_safe(data)?;
        image::load_from_memory(data)
            .map_err(|e| MonotoneError::decode_failed(format!("decode failed: {e}")))
    })
}

/// Detect input format using magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Decode encoded bytes into an upright RGBA buffer.
///
/// Detects the container once by magic bytes, routes to the fastest decoder
/// for it, and applies the EXIF orientation for JPEG input.
pub fn decode_image(bytes: &[u8]) -> EngineResult<(PixelBuffer, Option<ImageFormat>)> {
    if bytes.is_empty() {
        return Err(MonotoneError::corrupted_image());
    }
    let detected = detect_format(bytes);
    let img = match detected {
        Some(ImageFormat::Jpeg) => decode_jpeg_mozjpeg(bytes)?,
        Some(ImageFormat::Png) => decode_png_zune(bytes)?,
        Some(ImageFormat::WebP) => decode_webp_libwebp(bytes)?,
        Some(_) => decode_with_image_crate(bytes)?,
        None => return Err(MonotoneError::unsupported_format("unknown")),
    };

    let img = match detected {
        Some(ImageFormat::Jpeg) => match detect_exif_orientation(bytes) {
            Some(orientation) => {
                debug!(target: "monotone::decoder", orientation, "applying EXIF orientation");
                apply_orientation(img, orientation)
            }
            None => img,
        },
        _ => img,
    };

    Ok((PixelBuffer::from(img), detected))
}

/// Rotate/flip per EXIF orientation 1-8. Other values are ignored.
pub fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Reject images over the engine-wide decompression-bomb limits.
pub fn check_dimensions(width: u32, height: u32) -> EngineResult<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(MonotoneError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(MonotoneError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Read the header only and check dimensions before any pixel allocation.
pub fn ensure_dimensions_safe(bytes: &[u8]) -> EngineResult<()> {
    if let Some((width, height)) = peek_dimensions(bytes) {
        return check_dimensions(width, height);
    }
    Ok(())
}

/// Header dimensions, if the container is recognised.
pub fn peek_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Extract EXIF Orientation tag (1-8). Returns None if missing or invalid.
pub fn detect_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = u16::try_from(field.value.get_uint(0)?).ok()?;
    (1..=8).contains(&orientation).then_some(orientation)
}
