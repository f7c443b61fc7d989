// src/engine/buffer.rs
//
// Move-only RGBA8 pixel buffer and the request/response values that carry it
// across the worker boundary.

use crate::error::MonotoneError;
use crate::ops::{FilterParameters, RenderMode};
use image::{DynamicImage, RgbaImage};

/// Width x height RGBA8 pixels, row-major, tightly packed.
///
/// Deliberately not `Clone`: handing a buffer to the engine or a worker moves
/// it, so the sender cannot read or write it afterwards. Copy the bytes
/// explicitly (`as_bytes().to_vec()`) if you need to keep the original.
#[derive(Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA bytes. Fails when `data.len() != width * height * 4`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MonotoneError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(4))
            .ok_or_else(|| {
                MonotoneError::invalid_argument(
                    "dimensions",
                    format!("{width}x{height}"),
                    "pixel count overflows usize",
                )
            })?;
        if data.len() != expected {
            return Err(MonotoneError::invalid_buffer_shape(
                width,
                height,
                expected,
                data.len(),
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Solid-colour buffer, mostly for tests and placeholders.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * 4);
        for _ in 0..count {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGBA of the pixel at (x, y). Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn into_rgba_image(self) -> RgbaImage {
        // Length is validated on construction, so from_raw cannot fail here.
        RgbaImage::from_raw(self.width, self.height, self.data)
            .unwrap_or_else(|| unreachable!("PixelBuffer length invariant violated"))
    }

    /// Approximate heap footprint in bytes.
    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }
}

impl From<RgbaImage> for PixelBuffer {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

impl From<DynamicImage> for PixelBuffer {
    fn from(img: DynamicImage) -> Self {
        match img {
            DynamicImage::ImageRgba8(rgba) => rgba.into(),
            other => other.to_rgba8().into(),
        }
    }
}

/// One transform invocation: created per call, consumed once.
#[derive(Debug)]
pub struct TransformRequest {
    pub buffer: PixelBuffer,
    pub params: FilterParameters,
    pub mode: RenderMode,
    /// Grain seed; `None` uses the engine default so results are reproducible.
    pub grain_seed: Option<u64>,
}

impl TransformRequest {
    pub fn preview(buffer: PixelBuffer, params: FilterParameters) -> Self {
        Self {
            buffer,
            params,
            mode: RenderMode::Preview,
            grain_seed: None,
        }
    }

    pub fn final_pass(buffer: PixelBuffer, params: FilterParameters) -> Self {
        Self {
            buffer,
            params,
            mode: RenderMode::Final,
            grain_seed: None,
        }
    }

    pub fn with_grain_seed(mut self, seed: u64) -> Self {
        self.grain_seed = Some(seed);
        self
    }
}

/// Result of one transform invocation.
#[derive(Debug)]
pub struct TransformResponse {
    pub buffer: PixelBuffer,
    pub mode: RenderMode,
}
