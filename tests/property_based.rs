use monotone::engine::{transform, transform_seeded, PixelBuffer};
use monotone::ops::{FilterParameters, Preset};
use proptest::prelude::*;

fn buffer_strategy() -> impl Strategy<Value = PixelBuffer> {
    (1u32..=16, 1u32..=16).prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<u8>(), (w * h * 4) as usize)
            .prop_map(move |data| PixelBuffer::new(w, h, data).unwrap())
    })
}

fn params_strategy() -> impl Strategy<Value = FilterParameters> {
    (
        -150.0f32..250.0,
        -20.0f32..250.0,
        -10.0f32..120.0,
        -10.0f32..60.0,
        -80.0f32..80.0,
        -80.0f32..80.0,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(contrast, brightness, sepia, grain, shadows, highlights, invert, grayscale)| {
                FilterParameters {
                    contrast,
                    brightness,
                    sepia,
                    grain,
                    shadows,
                    highlights,
                    invert,
                    grayscale,
                }
            },
        )
}

fn copy(buffer: &PixelBuffer) -> PixelBuffer {
    PixelBuffer::new(buffer.width(), buffer.height(), buffer.as_bytes().to_vec()).unwrap()
}

proptest! {
    #[test]
    fn identity_leaves_bytes_untouched(buffer in buffer_strategy()) {
        let expected = buffer.as_bytes().to_vec();
        let out = transform(buffer, &FilterParameters::identity()).unwrap();
        prop_assert_eq!(out.as_bytes(), expected.as_slice());
    }

    #[test]
    fn invert_twice_restores_input(buffer in buffer_strategy()) {
        let invert = FilterParameters::identity().with_invert(true);
        let original = buffer.as_bytes().to_vec();
        let once = transform(buffer, &invert).unwrap();
        let twice = transform(once, &invert).unwrap();
        prop_assert_eq!(twice.as_bytes(), original.as_slice());
    }

    #[test]
    fn grayscale_without_sepia_is_neutral(
        buffer in buffer_strategy(),
        params in params_strategy(),
        seed in any::<u64>(),
    ) {
        let params = params.with_grayscale(true).with_sepia(0.0);
        let out = transform_seeded(buffer, &params, seed).unwrap();
        for px in out.as_bytes().chunks_exact(4) {
            prop_assert_eq!(px[0], px[1]);
            prop_assert_eq!(px[1], px[2]);
        }
    }

    #[test]
    fn dimensions_and_alpha_survive_any_parameters(
        buffer in buffer_strategy(),
        params in params_strategy(),
    ) {
        let dims = buffer.dimensions();
        let alpha: Vec<u8> = buffer.as_bytes().chunks_exact(4).map(|px| px[3]).collect();
        let out = transform(buffer, &params).unwrap();
        prop_assert_eq!(out.dimensions(), dims);
        let out_alpha: Vec<u8> = out.as_bytes().chunks_exact(4).map(|px| px[3]).collect();
        prop_assert_eq!(out_alpha, alpha);
    }

    #[test]
    fn out_of_range_parameters_behave_like_clamped_ones(
        buffer in buffer_strategy(),
        params in params_strategy(),
    ) {
        let clamped = params.clamped();
        let a = transform(copy(&buffer), &params).unwrap();
        let b = transform(buffer, &clamped).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn presets_are_deterministic(buffer in buffer_strategy(), index in 0usize..Preset::ALL.len()) {
        let params = Preset::ALL[index].params();
        let a = transform(copy(&buffer), &params).unwrap();
        let b = transform(buffer, &params).unwrap();
        prop_assert_eq!(a, b);
    }
}
