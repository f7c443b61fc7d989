#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use monotone::engine::{transform_seeded, PixelBuffer};
use monotone::ops::FilterParameters;

#[derive(Arbitrary, Debug)]
struct Input {
    width: u8,
    height: u8,
    contrast: f32,
    brightness: f32,
    sepia: f32,
    grain: f32,
    shadows: f32,
    highlights: f32,
    invert: bool,
    grayscale: bool,
    seed: u64,
    pixels: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let width = input.width as u32 % 64 + 1;
    let height = input.height as u32 % 64 + 1;
    let len = (width * height * 4) as usize;
    let mut data = input.pixels;
    data.resize(len, 0x80);
    let Ok(buffer) = PixelBuffer::new(width, height, data) else {
        return;
    };
    let alpha: Vec<u8> = buffer.as_bytes().chunks_exact(4).map(|px| px[3]).collect();

    let params = FilterParameters {
        contrast: input.contrast,
        brightness: input.brightness,
        sepia: input.sepia,
        grain: input.grain,
        shadows: input.shadows,
        highlights: input.highlights,
        invert: input.invert,
        grayscale: input.grayscale,
    };
    match transform_seeded(buffer, &params, input.seed) {
        Ok(out) => {
            assert_eq!(out.dimensions(), (width, height));
            let out_alpha: Vec<u8> = out.as_bytes().chunks_exact(4).map(|px| px[3]).collect();
            assert_eq!(out_alpha, alpha);
        }
        Err(_) => assert!(params.validate().is_err()),
    }
});
