// src/engine.rs
//
// The core of monotone. A photo goes through:
// 1. Intake: bytes -> upright RGBA PixelBuffer (decoder, io)
// 2. Transform: one pass over the pixels (pipeline), downsampled first for previews
// 3. Output: encode with a size budget and name the file (encoder)
//
// Work is dispatched either through the single-slot DispatchWorker (preview and
// export of the image on screen) or the BatchWorker (many uploads at once).

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Larger images are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULES
// =============================================================================

pub mod batch;
pub mod buffer;
pub mod common;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod io;
pub mod memory;
pub mod pipeline;
pub mod pool;
pub mod resize;
pub mod worker;

pub use batch::{
    BatchCoordinator, BatchItem, BatchResponse, BatchSummary, BatchWorker, ProcessedImageRecord,
    RecordStatus,
};
pub use buffer::{PixelBuffer, TransformRequest, TransformResponse};
pub use common::{run_with_panic_policy, EngineResult};
pub use config::{EncoderConfig, EngineConfig, IntakeLimits, IntakePolicy};
pub use decoder::{check_dimensions, decode_image};
pub use encoder::{encode, EncodedPayload, Encoder, ExportPlan};
pub use io::{output_filename, OriginalFileInfo, Source};
pub use pipeline::{run_request, transform, transform_seeded, DEFAULT_GRAIN_SEED};
pub use resize::downsample_for_preview;
pub use worker::{DispatchWorker, PreviewDebouncer, Ticket, WorkerEvent};
