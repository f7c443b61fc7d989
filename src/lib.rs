// lib.rs
//
// monotone: photo to black-and-white tone mapping engine
//
// - One-pass pixel transform driven by a small set of filter parameters
// - Downsampled previews on a background worker, full-resolution exports
// - Size-governed JPEG/WebP/PNG output named after the upload

// jemalloc is not supported on Windows/MSVC
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod engine;
pub mod error;
pub mod ops;

use image::ImageReader;
use std::io::{BufRead, BufReader, Cursor, Seek};

pub use engine::{
    encode, transform, BatchCoordinator, BatchWorker, DispatchWorker, EncodedPayload,
    EngineConfig, OriginalFileInfo, PixelBuffer, PreviewDebouncer,
};
pub use error::{MonotoneError, Result};
pub use ops::{FilterParameters, OutputFormat, Preset, RenderMode};

/// Header-only image facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectMetadata {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
}

fn read_inspect_metadata<R: BufRead + Seek>(reader: R) -> Result<InspectMetadata> {
    let reader = ImageReader::new(reader)
        .with_guessed_format()
        .map_err(|e| MonotoneError::decode_failed(format!("failed to read image header: {e}")))?;

    let format = reader.format().map(|f| format!("{f:?}").to_lowercase());
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| MonotoneError::decode_failed(format!("failed to read dimensions: {e}")))?;

    Ok(InspectMetadata {
        width,
        height,
        format,
    })
}

/// Read dimensions and format WITHOUT decoding pixels.
///
/// Lets an intake layer reject oversized uploads before spending memory on them.
pub fn inspect_header_from_bytes(data: &[u8]) -> Result<InspectMetadata> {
    read_inspect_metadata(Cursor::new(data))
}

pub fn inspect_header_from_path(path: &str) -> Result<InspectMetadata> {
    use std::fs::File;

    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MonotoneError::file_not_found(path.to_string())
        } else {
            MonotoneError::file_read_failed(path.to_string(), e)
        }
    })?;
    read_inspect_metadata(BufReader::new(file))
}

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Input formats the decoder routes to a dedicated codec.
pub fn supported_input_formats() -> &'static [&'static str] {
    &["jpeg", "jpg", "png", "webp"]
}

pub fn supported_output_formats() -> Vec<&'static str> {
    [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::WebP]
        .iter()
        .map(|f| f.as_str())
        .collect()
}
