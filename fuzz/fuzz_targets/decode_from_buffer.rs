#![no_main]

use monotone::engine::config::IntakeLimits;
use monotone::engine::decode_image;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // keep the fuzzer away from legitimately huge allocations
    let limits = IntakeLimits::strict();
    if limits.enforce_source_len(data.len()).is_err() {
        return;
    }
    if let Ok((buffer, _)) = decode_image(data) {
        assert_eq!(buffer.as_bytes().len(), buffer.pixel_count() * 4);
    }
});
