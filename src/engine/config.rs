// src/engine/config.rs
//
// Engine configuration: preview/debounce tuning, intake limits, encoder quality policy.
// Defaults are overridable from the environment.

use crate::error::MonotoneError;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PREVIEW_MAX_DIMENSION: u32 = 800;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

pub const ENV_PREVIEW_MAX_DIM: &str = "MONOTONE_PREVIEW_MAX_DIM";
pub const ENV_DEBOUNCE_MS: &str = "MONOTONE_DEBOUNCE_MS";
pub const ENV_BATCH_THREADS: &str = "MONOTONE_BATCH_THREADS";

const STRICT_MAX_PIXELS: u64 = 40_000_000; // ~8K x 5K
const LENIENT_MAX_PIXELS: u64 = 75_000_000; // below the global MAX_PIXELS
const STRICT_MAX_BYTES: u64 = 32 * 1024 * 1024;
const LENIENT_MAX_BYTES: u64 = 48 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntakePolicy {
    Disabled,
    Strict,
    Lenient,
    Custom,
}

/// Upload limits checked before decode (bytes) and after header parse (pixels).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeLimits {
    pub enabled: bool,
    pub policy: IntakePolicy,
    pub max_pixels: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: IntakePolicy::Disabled,
            max_pixels: None,
            max_bytes: None,
        }
    }
}

impl IntakeLimits {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            enabled: true,
            policy: IntakePolicy::Strict,
            max_pixels: Some(STRICT_MAX_PIXELS),
            max_bytes: Some(STRICT_MAX_BYTES),
        }
    }

    pub fn lenient() -> Self {
        Self {
            enabled: true,
            policy: IntakePolicy::Lenient,
            max_pixels: Some(LENIENT_MAX_PIXELS),
            max_bytes: Some(LENIENT_MAX_BYTES),
        }
    }

    pub fn custom(max_bytes: Option<u64>, max_pixels: Option<u64>) -> Self {
        Self {
            enabled: true,
            policy: IntakePolicy::Custom,
            max_pixels,
            max_bytes,
        }
    }

    pub fn apply_policy(policy: IntakePolicy) -> Self {
        match policy {
            IntakePolicy::Disabled => Self::disabled(),
            IntakePolicy::Strict => Self::strict(),
            IntakePolicy::Lenient => Self::lenient(),
            IntakePolicy::Custom => Self::custom(None, None),
        }
    }

    pub fn enforce_source_len(&self, len: usize) -> Result<(), MonotoneError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(limit) = self.max_bytes {
            let len = len as u64;
            if len > limit {
                return Err(MonotoneError::intake_limit_exceeded(format!(
                    "input size {len} bytes exceeds limit of {limit} bytes"
                )));
            }
        }
        Ok(())
    }

    pub fn enforce_pixels(&self, width: u32, height: u32) -> Result<(), MonotoneError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(limit) = self.max_pixels {
            let pixels = width as u64 * height as u64;
            if pixels > limit {
                return Err(MonotoneError::intake_limit_exceeded(format!(
                    "{width}x{height} ({pixels} pixels) exceeds limit of {limit} pixels"
                )));
            }
        }
        Ok(())
    }
}

/// Quality policy for lossy encoding. Qualities are in 0.0..=1.0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderConfig {
    pub jpeg_quality: f32,
    pub webp_quality: f32,
    /// Lowest quality the size-governance loop will try.
    pub quality_floor: f32,
    /// Decrement per governance attempt.
    pub quality_step: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 0.92,
            webp_quality: 0.96,
            quality_floor: 0.5,
            quality_step: 0.05,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), MonotoneError> {
        let unit = |name: &'static str, v: f32| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(MonotoneError::invalid_argument(
                    name,
                    v.to_string(),
                    "must be within 0.0..=1.0",
                ))
            }
        };
        unit("jpeg_quality", self.jpeg_quality)?;
        unit("webp_quality", self.webp_quality)?;
        unit("quality_floor", self.quality_floor)?;
        if !(self.quality_step.is_finite() && self.quality_step > 0.0) {
            return Err(MonotoneError::invalid_argument(
                "quality_step",
                self.quality_step.to_string(),
                "must be a positive number",
            ));
        }
        Ok(())
    }
}

/// Top-level engine tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Longest side of a preview render, in pixels.
    pub preview_max_dimension: u32,
    /// Quiet period before a preview is dispatched after a slider move.
    pub debounce: Duration,
    /// Batch pool size; `None` sizes from available parallelism.
    pub batch_threads: Option<usize>,
    pub intake: IntakeLimits,
    pub encoder: EncoderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preview_max_dimension: DEFAULT_PREVIEW_MAX_DIMENSION,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            batch_threads: None,
            intake: IntakeLimits::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MONOTONE_*` environment variables.
    ///
    /// Unparseable or zero values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_positive::<u32>(&lookup, ENV_PREVIEW_MAX_DIM) {
            config.preview_max_dimension = v;
        }
        if let Some(v) = parse_positive::<u64>(&lookup, ENV_DEBOUNCE_MS) {
            config.debounce = Duration::from_millis(v);
        }
        config.batch_threads = parse_positive::<usize>(&lookup, ENV_BATCH_THREADS);
        config
    }

    pub fn with_intake(mut self, intake: IntakeLimits) -> Self {
        self.intake = intake;
        self
    }

    pub fn with_preview_max_dimension(mut self, max: u32) -> Self {
        self.preview_max_dimension = max;
        self
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Some(v),
        _ => {
            warn!(target: "monotone::config", key, value = %raw, "ignoring invalid override");
            None
        }
    }
}
