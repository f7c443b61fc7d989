// src/engine/pipeline.rs
//
// Per-pixel tone mapping: grayscale, brightness, contrast, split tone,
// sepia, grain, invert. Alpha is never touched.

use super::buffer::{PixelBuffer, TransformRequest, TransformResponse};
use super::common::EngineResult;
use crate::ops::FilterParameters;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Seed used when the caller does not pick one, so plain `transform` is repeatable.
pub const DEFAULT_GRAIN_SEED: u64 = 0x6d6f_6e6f_746f_6e65;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

const MIDPOINT: f32 = 128.0;

const SEPIA_MATRIX: [[f32; 3]; 3] = [
    [0.393, 0.769, 0.189],
    [0.349, 0.686, 0.168],
    [0.272, 0.534, 0.131],
];

/// Rec. 601 luma of an RGB triple, unrounded.
#[inline]
pub fn luminance(r: f32, g: f32, b: f32) -> f32 {
    LUMA_R * r + LUMA_G * g + LUMA_B * b
}

/// Apply `params` to `buffer` using the default grain seed.
///
/// Output has the same dimensions as the input. Identity parameters return the
/// input buffer untouched.
pub fn transform(buffer: PixelBuffer, params: &FilterParameters) -> EngineResult<PixelBuffer> {
    transform_seeded(buffer, params, DEFAULT_GRAIN_SEED)
}

/// Same as [`transform`] with an explicit grain seed.
pub fn transform_seeded(
    mut buffer: PixelBuffer,
    params: &FilterParameters,
    seed: u64,
) -> EngineResult<PixelBuffer> {
    params.validate()?;
    let params = params.clamped();
    if params.is_identity() || buffer.pixel_count() == 0 {
        return Ok(buffer);
    }

    trace!(
        target: "monotone::pipeline",
        width = buffer.width(),
        height = buffer.height(),
        "applying tone map"
    );

    let tone = ToneCurve::new(&params);
    let mut grain = (params.grain > 0.0).then(|| Grain::new(params.grain, seed));

    for px in buffer.as_bytes_mut().chunks_exact_mut(4) {
        let noise = grain.as_mut().map_or(0.0, Grain::sample);
        let [r, g, b] = tone.apply([px[0] as f32, px[1] as f32, px[2] as f32], noise);
        px[0] = r;
        px[1] = g;
        px[2] = b;
    }

    Ok(buffer)
}

/// Run a request end to end. Preview downsampling is the caller's job.
pub fn run_request(request: TransformRequest) -> EngineResult<TransformResponse> {
    let TransformRequest {
        buffer,
        params,
        mode,
        grain_seed,
    } = request;
    let buffer = transform_seeded(buffer, &params, grain_seed.unwrap_or(DEFAULT_GRAIN_SEED))?;
    Ok(TransformResponse { buffer, mode })
}

/// Parameters pre-digested into the constants the inner loop needs.
struct ToneCurve {
    grayscale: bool,
    gain: f32,
    contrast: f32,
    shadows: f32,
    highlights: f32,
    sepia: f32,
    invert: bool,
}

impl ToneCurve {
    fn new(p: &FilterParameters) -> Self {
        Self {
            grayscale: p.grayscale,
            gain: p.brightness / 100.0,
            contrast: p.contrast_factor(),
            shadows: p.shadows,
            highlights: p.highlights,
            sepia: p.sepia / 100.0,
            invert: p.invert,
        }
    }

    #[inline]
    fn apply(&self, rgb: [f32; 3], noise: f32) -> [u8; 3] {
        let mut c = rgb;

        if self.grayscale {
            let l = luminance(c[0], c[1], c[2]);
            c = [l, l, l];
        }

        for v in &mut c {
            *v = clamp_channel((*v * self.gain - MIDPOINT) * self.contrast + MIDPOINT);
        }

        if self.shadows != 0.0 || self.highlights != 0.0 {
            let l = luminance(c[0], c[1], c[2]);
            let ws = ((MIDPOINT - l) / 128.0).clamp(0.0, 1.0);
            let wh = ((l - MIDPOINT) / 127.0).clamp(0.0, 1.0);
            let lift = self.shadows * ws + self.highlights * wh;
            for v in &mut c {
                *v = clamp_channel(*v + lift);
            }
        }

        if self.sepia > 0.0 {
            let toned = SEPIA_MATRIX.map(|row| row[0] * c[0] + row[1] * c[1] + row[2] * c[2]);
            for (v, t) in c.iter_mut().zip(toned) {
                *v = clamp_channel(*v * (1.0 - self.sepia) + t * self.sepia);
            }
        }

        if noise != 0.0 {
            for v in &mut c {
                *v = clamp_channel(*v + noise);
            }
        }

        if self.invert {
            for v in &mut c {
                *v = 255.0 - *v;
            }
        }

        c.map(|v| clamp_channel(v).round() as u8)
    }
}

#[inline]
fn clamp_channel(v: f32) -> f32 {
    v.clamp(0.0, 255.0)
}

/// One uniform sample per pixel in `[-amplitude, amplitude]`.
struct Grain {
    rng: SmallRng,
    amplitude: f32,
}

impl Grain {
    fn new(amplitude: f32, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            amplitude,
        }
    }

    #[inline]
    fn sample(&mut self) -> f32 {
        self.rng.random_range(-self.amplitude..=self.amplitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonotoneError;
    use crate::ops::Preset;

    fn strip(pixels: &[[u8; 4]]) -> PixelBuffer {
        PixelBuffer::new(
            pixels.len() as u32,
            1,
            pixels.iter().flatten().copied().collect(),
        )
        .unwrap()
    }

    fn gradient(width: u32, height: u32) -> PixelBuffer {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 7 % 256) as u8, (y * 13 % 256) as u8, 90, 200]);
            }
        }
        PixelBuffer::new(width, height, data).unwrap()
    }

    #[test]
    fn identity_returns_input_bytes() {
        let input = gradient(16, 9);
        let expected = input.as_bytes().to_vec();
        let out = transform(input, &FilterParameters::identity()).unwrap();
        assert_eq!(out.as_bytes(), expected.as_slice());
    }

    #[test]
    fn classic_collapses_to_rounded_luma() {
        let input = strip(&[
            [200, 100, 50, 255],
            [10, 10, 10, 255],
            [0, 0, 0, 0],
            [255, 255, 255, 255],
        ]);
        let out = transform(input, &Preset::Classic.params()).unwrap();
        assert_eq!(out.pixel(0, 0), [124, 124, 124, 255]);
        assert_eq!(out.pixel(1, 0), [10, 10, 10, 255]);
        assert_eq!(out.pixel(2, 0), [0, 0, 0, 0]);
        assert_eq!(out.pixel(3, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn alpha_is_untouched_by_every_preset() {
        for preset in Preset::ALL {
            let input = strip(&[[30, 60, 90, 17], [250, 10, 128, 0], [5, 5, 5, 254]]);
            let out = transform(input, &preset.params()).unwrap();
            let alphas: Vec<u8> = out.as_bytes().iter().skip(3).step_by(4).copied().collect();
            assert_eq!(alphas, vec![17, 0, 254], "{preset:?}");
        }
    }

    #[test]
    fn invert_only_mirrors_channels() {
        let input = strip(&[[0, 128, 255, 9]]);
        let out = transform(input, &FilterParameters::identity().with_invert(true)).unwrap();
        assert_eq!(out.pixel(0, 0), [255, 127, 0, 9]);
    }

    #[test]
    fn zero_brightness_is_black() {
        // contrast 0 keeps the midpoint fixed, so 0 gain must give 0
        let input = strip(&[[200, 150, 100, 255]]);
        let out = transform(input, &FilterParameters::identity().with_brightness(0.0)).unwrap();
        assert_eq!(out.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn minimum_contrast_flattens_to_midpoint() {
        let input = strip(&[[0, 90, 255, 255]]);
        let out = transform(input, &FilterParameters::identity().with_contrast(-100.0)).unwrap();
        assert_eq!(out.pixel(0, 0), [128, 128, 128, 255]);
    }

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let input = strip(&[[0, 90, 255, 255]]);
        let wild = FilterParameters::identity().with_contrast(-1000.0);
        let out = transform(input, &wild).unwrap();
        assert_eq!(out.pixel(0, 0), [128, 128, 128, 255]);
    }

    #[test]
    fn non_finite_parameters_are_rejected() {
        let input = strip(&[[1, 2, 3, 4]]);
        let err = transform(input, &FilterParameters::identity().with_sepia(f32::NAN)).unwrap_err();
        assert!(matches!(err, MonotoneError::InvalidArgument { .. }));
    }

    #[test]
    fn shadows_lift_dark_tones_more_than_bright() {
        let params = FilterParameters::identity().with_shadows(40.0);
        let out = transform(strip(&[[20, 20, 20, 255], [200, 200, 200, 255]]), &params).unwrap();
        let dark_gain = out.pixel(0, 0)[0] as i32 - 20;
        let bright_gain = out.pixel(1, 0)[0] as i32 - 200;
        assert!(dark_gain > 30, "dark gain {dark_gain}");
        assert_eq!(bright_gain, 0);
    }

    #[test]
    fn sepia_warms_a_neutral_gray() {
        let params = FilterParameters::identity().with_sepia(100.0);
        let out = transform(strip(&[[100, 100, 100, 255]]), &params).unwrap();
        let [r, g, b, _] = out.pixel(0, 0);
        assert!(r > g && g > b, "got {r},{g},{b}");
    }

    #[test]
    fn grain_is_deterministic_per_seed() {
        let params = FilterParameters::identity().with_grain(25.0);
        let a = transform(PixelBuffer::filled(32, 32, [128, 128, 128, 255]), &params).unwrap();
        let b = transform(PixelBuffer::filled(32, 32, [128, 128, 128, 255]), &params).unwrap();
        assert_eq!(a, b);

        let c = transform_seeded(PixelBuffer::filled(32, 32, [128, 128, 128, 255]), &params, 7)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn grain_is_shared_across_channels_and_bounded() {
        let params = FilterParameters::identity().with_grain(10.0);
        let out = transform(PixelBuffer::filled(16, 16, [128, 128, 128, 255]), &params).unwrap();
        for px in out.as_bytes().chunks_exact(4) {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
            assert!((118..=138).contains(&px[0]));
        }
    }

    #[test]
    fn run_request_uses_request_seed_and_mode() {
        let params = FilterParameters::identity().with_grain(20.0);
        let req = TransformRequest::final_pass(PixelBuffer::filled(8, 8, [60, 60, 60, 255]), params)
            .with_grain_seed(42);
        let resp = run_request(req).unwrap();
        assert_eq!(resp.mode, crate::ops::RenderMode::Final);

        let direct =
            transform_seeded(PixelBuffer::filled(8, 8, [60, 60, 60, 255]), &params, 42).unwrap();
        assert_eq!(resp.buffer, direct);
    }

    #[test]
    fn empty_buffer_passes_through() {
        let out = transform(PixelBuffer::new(0, 0, vec![]).unwrap(), &Preset::FilmNoir.params())
            .unwrap();
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn luminance_weights_sum_to_one() {
        assert!((luminance(255.0, 255.0, 255.0) - 255.0).abs() < 1e-3);
    }
}
