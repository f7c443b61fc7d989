#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use monotone::engine::{decode_image, encode, PixelBuffer};
use monotone::ops::OutputFormat;

#[derive(Arbitrary, Debug)]
struct Input {
    width: u8,
    height: u8,
    format: u8,
    quality: Option<f32>,
    max_bytes: Option<u16>,
    pixels: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let width = input.width as u32 % 48 + 1;
    let height = input.height as u32 % 48 + 1;
    let mut data = input.pixels;
    data.resize((width * height * 4) as usize, 0);
    let Ok(buffer) = PixelBuffer::new(width, height, data) else {
        return;
    };
    let format = match input.format % 3 {
        0 => OutputFormat::Png,
        1 => OutputFormat::Jpeg,
        _ => OutputFormat::WebP,
    };

    let Ok(payload) = encode(&buffer, format, input.quality, input.max_bytes.map(u64::from)) else {
        return;
    };
    assert!(!payload.is_empty());
    if let Ok((decoded, _)) = decode_image(&payload.bytes) {
        assert_eq!(decoded.dimensions(), (width, height));
    }
});
