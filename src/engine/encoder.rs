// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp),
// plus byte-budget governance for the lossy formats.

use super::buffer::PixelBuffer;
use super::common::{run_with_panic_policy, EngineResult};
use super::config::EncoderConfig;
use super::io::{output_filename, write_atomic, OriginalFileInfo};
use super::MAX_DIMENSION;
use crate::error::MonotoneError;
use crate::ops::OutputFormat;
use image::{ExtendedColorType, ImageEncoder};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Derives per-codec tuning from a 0-100 quality value.
///
/// Bands:
/// - High (>=85): visual quality first
/// - Balanced (70-84)
/// - Fast (<70): the governance loop lives here when squeezing bytes
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
}

impl QualitySettings {
    /// From a 0.0..=1.0 quality, as used throughout the public API.
    pub fn from_unit(quality: f32) -> Self {
        Self {
            quality: (quality.clamp(0.0, 1.0) * 100.0).round(),
        }
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else {
            QualityBand::Fast
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        match self.band() {
            QualityBand::High => 0,
            QualityBand::Balanced => 5,
            QualityBand::Fast => 10,
        }
    }

    pub fn webp_method(&self) -> i32 {
        4
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast => 0,
        }
    }
}

fn check_encodable(buffer: &PixelBuffer, format: &'static str) -> EngineResult<()> {
    let (w, h) = buffer.dimensions();
    if w == 0 || h == 0 {
        return Err(MonotoneError::encode_failed(
            format,
            "image has zero width or height",
        ));
    }
    if w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(MonotoneError::dimension_exceeds_limit(w.max(h), MAX_DIMENSION));
    }
    Ok(())
}

/// Flatten RGBA onto an opaque white background.
fn composite_over_white(rgba: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        let a = px[3] as u32;
        for &c in &px[..3] {
            // c*a + 255*(255-a), divided by 255 with rounding
            rgb.push(((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8);
        }
    }
    rgb
}

/// Encode to JPEG using mozjpeg. Alpha is composited over white.
pub fn encode_jpeg(buffer: &PixelBuffer, quality: f32) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        check_encodable(buffer, "jpeg")?;
        let (w, h) = buffer.dimensions();
        let settings = QualitySettings::from_unit(quality);
        let rgb = composite_over_white(buffer.as_bytes());

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(settings.quality());
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_optimize_scans(true);
        comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        comp.set_smoothing_factor(settings.jpeg_smoothing());

        let mut output = Vec::with_capacity((w as usize * h as usize * 3 / 10).max(4096));
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                MonotoneError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
            })?;
            for row in rgb.chunks(w as usize * 3) {
                writer.write_scanlines(row).map_err(|e| {
                    MonotoneError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: failed to write scanlines: {e:?}"),
                    )
                })?;
            }
            writer.finish().map_err(|e| {
                MonotoneError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }
        Ok(output)
    })
}

/// Encode to PNG using the image crate, then recompress losslessly with oxipng.
pub fn encode_png(buffer: &PixelBuffer) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        check_encodable(buffer, "png")?;
        let (w, h) = buffer.dimensions();
        let mut raw = Vec::new();
        image::codecs::png::PngEncoder::new(&mut raw)
            .write_image(buffer.as_bytes(), w, h, ExtendedColorType::Rgba8)
            .map_err(|e| MonotoneError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        // oxipng picks the smallest colour type itself (gray, no alpha, ...)
        let mut options = oxipng::Options::from_preset(2);
        options.strip = oxipng::StripChunks::Safe;
        oxipng::optimize_from_memory(&raw, &options).map_err(|e| {
            MonotoneError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })
    })
}

/// Encode to lossy WebP, keeping alpha.
pub fn encode_webp(buffer: &PixelBuffer, quality: f32) -> EngineResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        check_encodable(buffer, "webp")?;
        let (w, h) = buffer.dimensions();
        let encoder = webp::Encoder::from_rgba(buffer.as_bytes(), w, h);

        let mut config = webp::WebPConfig::new()
            .map_err(|_| MonotoneError::internal_panic("failed to create WebPConfig"))?;
        let settings = QualitySettings::from_unit(quality);
        config.quality = settings.quality();
        config.method = settings.webp_method();
        config.pass = 1;
        config.preprocessing = 0;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();

        let mem = encoder.encode_advanced(&config).map_err(|e| {
            MonotoneError::encode_failed("webp", format!("WebP encode failed: {e:?}"))
        })?;
        Ok(mem.to_vec())
    })
}

/// Encoded bytes plus everything a save helper needs.
#[derive(Clone, Debug)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    /// Final quality used, `None` for PNG.
    pub quality: Option<f32>,
    /// True when `max_bytes` could not be met even at the quality floor.
    pub over_budget: bool,
    pub filename: String,
}

impl EncodedPayload {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Atomically write into `dir` under `self.filename`. Returns the full path.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> EngineResult<PathBuf> {
        let path = dir.as_ref().join(&self.filename);
        write_atomic(&path, &self.bytes)?;
        info!(
            target: "monotone::encoder",
            path = %path.display(),
            bytes = self.bytes.len(),
            "wrote export"
        );
        Ok(path)
    }
}

type LossyEncodeFn = fn(&PixelBuffer, f32) -> EngineResult<Vec<u8>>;

/// Encoder bound to a quality policy.
#[derive(Clone, Debug, Default)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode `buffer` as `format`, shrinking quality until `max_bytes` fits.
    ///
    /// Running out of quality is not an error: the floor-quality result comes
    /// back with `over_budget` set. The filename is a placeholder
    /// (`image-bw.<ext>`); [`ExportPlan`] supplies the real one.
    pub fn encode(
        &self,
        buffer: &PixelBuffer,
        format: OutputFormat,
        quality_hint: Option<f32>,
        max_bytes: Option<u64>,
    ) -> EngineResult<EncodedPayload> {
        let filename = output_filename("", format);
        let (encode_at, default_quality): (LossyEncodeFn, f32) = match format {
            OutputFormat::Jpeg => (encode_jpeg, self.config.jpeg_quality),
            OutputFormat::WebP => (encode_webp, self.config.webp_quality),
            OutputFormat::Png => {
                if let Some(limit) = max_bytes {
                    debug!(target: "monotone::encoder", limit, "PNG is lossless, ignoring max_bytes");
                }
                return Ok(EncodedPayload {
                    bytes: encode_png(buffer)?,
                    format,
                    quality: None,
                    over_budget: false,
                    filename,
                });
            }
        };

        let start = match quality_hint {
            Some(q) if q.is_finite() => q.clamp(0.0, 1.0),
            Some(q) => {
                return Err(MonotoneError::invalid_argument(
                    "quality",
                    q.to_string(),
                    "quality must be a finite number",
                ))
            }
            None => default_quality,
        };
        // A hint below the floor is honoured as-is and never lowered further
        let floor = self.config.quality_floor.min(start);

        let mut quality = start;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let bytes = encode_at(buffer, quality)?;

            let fits = max_bytes.map_or(true, |limit| bytes.len() as u64 <= limit);
            let at_floor = quality <= floor + f32::EPSILON;
            if fits || at_floor {
                let over_budget = !fits;
                if over_budget {
                    warn!(
                        target: "monotone::encoder",
                        format = format.as_str(),
                        size = bytes.len(),
                        limit = max_bytes.unwrap_or_default(),
                        quality,
                        "size budget not met at quality floor, returning best effort"
                    );
                } else if attempts > 1 {
                    debug!(
                        target: "monotone::encoder",
                        format = format.as_str(),
                        size = bytes.len(),
                        quality,
                        attempts,
                        "size budget met"
                    );
                }
                return Ok(EncodedPayload {
                    bytes,
                    format,
                    quality: Some(quality),
                    over_budget,
                    filename,
                });
            }

            debug!(
                target: "monotone::encoder",
                size = bytes.len(),
                quality,
                "over budget, lowering quality"
            );
            quality = step_down(quality, self.config.quality_step, floor);
        }
    }

    /// Encode according to an export plan and name the result after the upload.
    pub fn export(&self, buffer: &PixelBuffer, plan: &ExportPlan) -> EngineResult<EncodedPayload> {
        let payload = self.encode(buffer, plan.format, plan.quality_hint, plan.max_bytes)?;
        Ok(payload.with_filename(plan.filename.clone()))
    }
}

/// Next quality below `q`, snapped to hundredths so repeated steps do not drift.
///
/// Always strictly lower than `q` (until the floor), so steps smaller than the
/// snapping grid still make progress.
fn step_down(q: f32, step: f32, floor: f32) -> f32 {
    let current = (q * 100.0).round();
    let mut cents = ((q - step) * 100.0).round();
    if cents >= current {
        cents = current - 1.0;
    }
    (cents / 100.0).max(floor)
}

/// Encode with the default quality policy.
pub fn encode(
    buffer: &PixelBuffer,
    format: OutputFormat,
    quality_hint: Option<f32>,
    max_bytes: Option<u64>,
) -> EngineResult<EncodedPayload> {
    Encoder::default().encode(buffer, format, quality_hint, max_bytes)
}

/// How one processed image should be exported.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportPlan {
    pub format: OutputFormat,
    pub quality_hint: Option<f32>,
    /// Only set when re-exporting in the upload's own lossy format.
    pub max_bytes: Option<u64>,
    pub filename: String,
}

impl ExportPlan {
    /// Plan an export of `info` as `format`.
    ///
    /// The upload's size becomes the byte budget only when the output format
    /// matches the source and is lossy; converting formats is never capped.
    pub fn for_source(info: &OriginalFileInfo, format: OutputFormat) -> Self {
        let same_format = info.source_format() == Some(format);
        let max_bytes = (same_format && format.is_lossy() && info.size > 0).then_some(info.size);
        Self {
            format,
            quality_hint: None,
            max_bytes,
            filename: output_filename(&info.base_name, format),
        }
    }

    /// Plan an export in the upload's own format (PNG when unsupported).
    pub fn default_for(info: &OriginalFileInfo) -> Self {
        Self::for_source(info, info.default_output_format())
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality_hint = Some(quality);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(width: u32, height: u32) -> PixelBuffer {
        // xorshift noise compresses badly, so quality has a visible effect on size
        let mut state = 0x2545_f491_u32;
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state & 0xff) as u8;
            data.extend_from_slice(&[v, v, v, 255]);
        }
        PixelBuffer::new(width, height, data).unwrap()
    }

    #[test]
    fn jpeg_has_markers() {
        let out = encode_jpeg(&noisy(32, 32), 0.8).unwrap();
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
        assert_eq!(&out[out.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn png_has_signature() {
        let out = encode_png(&PixelBuffer::filled(20, 10, [1, 2, 3, 128])).unwrap();
        assert_eq!(&out[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn webp_has_riff_header() {
        let out = encode_webp(&PixelBuffer::filled(20, 10, [1, 2, 3, 128]), 0.9).unwrap();
        assert_eq!(&out[..4], b"RIFF");
        assert_eq!(&out[8..12], b"WEBP");
    }

    #[test]
    fn png_round_trips_exactly() {
        let buf = noisy(16, 16);
        let expected = buf.as_bytes().to_vec();
        let png = encode_png(&buf).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.into_raw(), expected);
    }

    #[test]
    fn jpeg_composites_alpha_over_white() {
        let buf = PixelBuffer::filled(16, 16, [0, 0, 0, 0]);
        let jpeg = encode_jpeg(&buf, 0.95).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert!(decoded.get_pixel(8, 8).0.iter().all(|&c| c > 245));
    }

    #[test]
    fn composite_keeps_opaque_pixels() {
        assert_eq!(composite_over_white(&[10, 20, 30, 255]), vec![10, 20, 30]);
        assert_eq!(composite_over_white(&[10, 20, 30, 0]), vec![255, 255, 255]);
    }

    #[test]
    fn default_quality_per_format() {
        let buf = noisy(8, 8);
        let jpeg = encode(&buf, OutputFormat::Jpeg, None, None).unwrap();
        assert_eq!(jpeg.quality, Some(0.92));
        let webp = encode(&buf, OutputFormat::WebP, None, None).unwrap();
        assert_eq!(webp.quality, Some(0.96));
        let png = encode(&buf, OutputFormat::Png, None, Some(1)).unwrap();
        assert_eq!(png.quality, None);
        assert!(!png.over_budget);
        assert_eq!(png.mime_type(), "image/png");
    }

    #[test]
    fn governance_meets_reachable_budget() {
        let buf = noisy(128, 128);
        let full = encode(&buf, OutputFormat::Jpeg, None, None).unwrap();
        // 0.72 is on the 0.92 - n*0.05 ladder, so this budget is met by then at the latest
        let budget = encode_jpeg(&buf, 0.72).unwrap().len() as u64;
        assert!(budget < full.len() as u64);
        let governed = encode(&buf, OutputFormat::Jpeg, None, Some(budget)).unwrap();
        assert!(!governed.over_budget);
        assert!(governed.len() as u64 <= budget);
        let quality = governed.quality.unwrap();
        assert!((0.72..0.92).contains(&quality), "quality {quality}");
    }

    #[test]
    fn governance_stops_at_floor() {
        let buf = noisy(64, 64);
        let out = encode(&buf, OutputFormat::WebP, None, Some(1)).unwrap();
        assert!(out.over_budget);
        assert_eq!(out.quality, Some(0.5));
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn hint_below_floor_is_not_lowered() {
        let out = encode(&noisy(32, 32), OutputFormat::Jpeg, Some(0.3), Some(1)).unwrap();
        assert_eq!(out.quality, Some(0.3));
        assert!(out.over_budget);
    }

    #[test]
    fn step_down_snaps_and_respects_floor() {
        assert_eq!(step_down(0.92, 0.05, 0.5), 0.87);
        assert_eq!(step_down(0.52, 0.05, 0.5), 0.5);
    }

    #[test]
    fn step_down_always_makes_progress() {
        assert_eq!(step_down(0.92, 0.004, 0.5), 0.91);
        assert_eq!(step_down(0.873, 0.001, 0.5), 0.86);
        assert!(step_down(0.876, 0.004, 0.5) < 0.876);
        assert_eq!(step_down(0.5, 0.001, 0.5), 0.5);
    }

    #[test]
    fn tiny_quality_step_still_reaches_floor() {
        let encoder = Encoder::new(EncoderConfig {
            quality_step: 0.004,
            ..EncoderConfig::default()
        })
        .unwrap();
        let out = encoder
            .encode(&noisy(32, 32), OutputFormat::Jpeg, None, Some(1))
            .unwrap();
        assert!(out.over_budget);
        assert_eq!(out.quality, Some(0.5));
    }

    #[test]
    fn export_plan_budget_only_for_same_lossy_format() {
        let jpeg = OriginalFileInfo::new("My Photo!!.jpg", "image/jpeg", 50_000);
        let plan = ExportPlan::for_source(&jpeg, OutputFormat::Jpeg);
        assert_eq!(plan.max_bytes, Some(50_000));
        assert_eq!(plan.filename, "My-Photo-bw.jpg");

        assert_eq!(ExportPlan::for_source(&jpeg, OutputFormat::WebP).max_bytes, None);

        let png = OriginalFileInfo::new("shot.png", "image/png", 50_000);
        assert_eq!(ExportPlan::default_for(&png).max_bytes, None);
    }

    #[test]
    fn export_names_payload_and_writes_it() {
        let info = OriginalFileInfo::new("My Photo!!.webp", "image/webp", 1_000_000);
        let plan = ExportPlan::default_for(&info);
        let payload = Encoder::default().export(&noisy(16, 16), &plan).unwrap();
        assert_eq!(payload.filename, "My-Photo-bw.webp");

        let dir = tempfile::tempdir().unwrap();
        let path = payload.write_to_dir(dir.path()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), payload.bytes);
    }

    #[test]
    fn empty_buffer_cannot_be_encoded() {
        let empty = PixelBuffer::new(0, 0, vec![]).unwrap();
        let err = encode(&empty, OutputFormat::Jpeg, None, None).unwrap_err();
        assert!(matches!(err, MonotoneError::EncodeFailed { .. }));
    }

    #[test]
    fn encoder_rejects_invalid_config() {
        let cfg = EncoderConfig {
            jpeg_quality: 1.5,
            ..EncoderConfig::default()
        };
        assert!(Encoder::new(cfg).is_err());
    }
}
