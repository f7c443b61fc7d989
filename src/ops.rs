// src/ops.rs
//
// Filter parameter model, preset catalogue, render modes and output formats.
// These are cheap values - the expensive work happens in engine::pipeline.

use crate::error::MonotoneError;
use serde::{Deserialize, Serialize};

pub const CONTRAST_RANGE: (f32, f32) = (-100.0, 200.0);
pub const BRIGHTNESS_RANGE: (f32, f32) = (0.0, 200.0);
pub const SEPIA_RANGE: (f32, f32) = (0.0, 100.0);
pub const GRAIN_RANGE: (f32, f32) = (0.0, 50.0);
pub const SHADOWS_RANGE: (f32, f32) = (-50.0, 50.0);
pub const HIGHLIGHTS_RANGE: (f32, f32) = (-50.0, 50.0);

/// One tonal transform request: sliders plus toggles.
///
/// Values are plain data. Out-of-range numbers are clamped by the engine;
/// only non-finite numbers are rejected (see [`FilterParameters::validate`]).
/// `Default` is the neutral transform, which leaves every pixel unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParameters {
    /// Contrast in percent, -100..=200. 0 = unchanged, curve factor is `1 + contrast/100`.
    pub contrast: f32,
    /// Brightness in percent, 0..=200. 100 = unchanged.
    pub brightness: f32,
    /// Warm tint strength in percent, 0..=100.
    pub sepia: f32,
    /// Noise amplitude in levels, 0..=50.
    pub grain: f32,
    /// Additive lift for dark tones, -50..=50.
    pub shadows: f32,
    /// Additive lift for bright tones, -50..=50.
    pub highlights: f32,
    pub invert: bool,
    pub grayscale: bool,
}

impl Default for FilterParameters {
    fn default() -> Self {
        Self::identity()
    }
}

impl FilterParameters {
    /// The neutral parameter set (no grayscale, no tint, no noise).
    pub const fn identity() -> Self {
        Self {
            contrast: 0.0,
            brightness: 100.0,
            sepia: 0.0,
            grain: 0.0,
            shadows: 0.0,
            highlights: 0.0,
            invert: false,
            grayscale: false,
        }
    }

    pub fn with_contrast(mut self, contrast: f32) -> Self {
        self.contrast = contrast;
        self
    }

    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.brightness = brightness;
        self
    }

    pub fn with_sepia(mut self, sepia: f32) -> Self {
        self.sepia = sepia;
        self
    }

    pub fn with_grain(mut self, grain: f32) -> Self {
        self.grain = grain;
        self
    }

    pub fn with_shadows(mut self, shadows: f32) -> Self {
        self.shadows = shadows;
        self
    }

    pub fn with_highlights(mut self, highlights: f32) -> Self {
        self.highlights = highlights;
        self
    }

    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    pub fn with_grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    /// Reject non-finite values. Range violations are not errors.
    pub fn validate(&self) -> Result<(), MonotoneError> {
        let fields = [
            ("contrast", self.contrast),
            ("brightness", self.brightness),
            ("sepia", self.sepia),
            ("grain", self.grain),
            ("shadows", self.shadows),
            ("highlights", self.highlights),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(MonotoneError::invalid_argument(
                    name,
                    value.to_string(),
                    "filter parameters must be finite numbers",
                ));
            }
        }
        Ok(())
    }

    /// Copy with every numeric field clamped to its documented range.
    pub fn clamped(&self) -> Self {
        let clamp = |v: f32, (lo, hi): (f32, f32)| v.clamp(lo, hi);
        Self {
            contrast: clamp(self.contrast, CONTRAST_RANGE),
            brightness: clamp(self.brightness, BRIGHTNESS_RANGE),
            sepia: clamp(self.sepia, SEPIA_RANGE),
            grain: clamp(self.grain, GRAIN_RANGE),
            shadows: clamp(self.shadows, SHADOWS_RANGE),
            highlights: clamp(self.highlights, HIGHLIGHTS_RANGE),
            invert: self.invert,
            grayscale: self.grayscale,
        }
    }

    /// True when the transform would return its input unchanged.
    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Multiplicative contrast curve factor, 0.0..=3.0.
    pub fn contrast_factor(&self) -> f32 {
        1.0 + self.contrast.clamp(CONTRAST_RANGE.0, CONTRAST_RANGE.1) / 100.0
    }
}

// =============================================================================
// PRESETS - Fixed catalogue of named looks
// =============================================================================

/// Built-in looks. Closed so adding one forces every match to handle it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    #[default]
    Classic,
    Dramatic,
    Soft,
    Vintage,
    HighContrast,
    FilmNoir,
}

/// A named, immutable parameter bundle with its display label.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresetConfig {
    pub preset: Preset,
    pub label: &'static str,
    pub params: FilterParameters,
}

const MONO: FilterParameters = FilterParameters {
    grayscale: true,
    ..FilterParameters::identity()
};

impl Preset {
    /// All presets in display order.
    pub const ALL: [Preset; 6] = [
        Preset::Classic,
        Preset::Dramatic,
        Preset::Soft,
        Preset::Vintage,
        Preset::HighContrast,
        Preset::FilmNoir,
    ];

    /// Get the built-in preset by name
    pub fn from_name(name: &str) -> Result<Self, MonotoneError> {
        match name.trim().to_lowercase().replace('_', "-").as_str() {
            "default" | "classic" => Ok(Self::Classic),
            "dramatic" => Ok(Self::Dramatic),
            "soft" => Ok(Self::Soft),
            "vintage" => Ok(Self::Vintage),
            "high-contrast" | "highcontrast" => Ok(Self::HighContrast),
            "film-noir" | "filmnoir" | "noir" => Ok(Self::FilmNoir),
            _ => Err(MonotoneError::invalid_preset(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Classic => "classic",
            Preset::Dramatic => "dramatic",
            Preset::Soft => "soft",
            Preset::Vintage => "vintage",
            Preset::HighContrast => "high-contrast",
            Preset::FilmNoir => "film-noir",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Preset::Classic => "Classic B&W",
            Preset::Dramatic => "Dramatic",
            Preset::Soft => "Soft",
            Preset::Vintage => "Vintage",
            Preset::HighContrast => "High Contrast",
            Preset::FilmNoir => "Film Noir",
        }
    }

    /// Parameter values for this preset (canonical contrast scale, 0 = unchanged).
    pub const fn params(&self) -> FilterParameters {
        match self {
            Preset::Classic => MONO,
            Preset::Dramatic => FilterParameters {
                contrast: 60.0,
                brightness: 95.0,
                shadows: -20.0,
                highlights: 15.0,
                ..MONO
            },
            Preset::Soft => FilterParameters {
                contrast: -20.0,
                brightness: 105.0,
                shadows: 15.0,
                highlights: -10.0,
                ..MONO
            },
            Preset::Vintage => FilterParameters {
                contrast: 10.0,
                sepia: 40.0,
                grain: 15.0,
                shadows: 5.0,
                highlights: -5.0,
                ..MONO
            },
            Preset::HighContrast => FilterParameters {
                contrast: 100.0,
                shadows: -30.0,
                highlights: 30.0,
                ..MONO
            },
            Preset::FilmNoir => FilterParameters {
                contrast: 80.0,
                brightness: 85.0,
                grain: 20.0,
                shadows: -35.0,
                highlights: 10.0,
                ..MONO
            },
        }
    }

    pub fn config(&self) -> PresetConfig {
        PresetConfig {
            preset: *self,
            label: self.label(),
            params: self.params(),
        }
    }
}

// =============================================================================
// RENDER MODE / OUTPUT FORMAT
// =============================================================================

/// Resolution policy for a transform request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Downsampled, low-latency pass for on-screen feedback.
    Preview,
    /// Full-resolution pass for export.
    Final,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Preview => "preview",
            RenderMode::Final => "final",
        }
    }
}

/// Output format for encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    WebP,
}

impl OutputFormat {
    pub fn from_name(format: &str) -> Result<Self, MonotoneError> {
        match format.trim().trim_start_matches('.').to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            other => Err(MonotoneError::unsupported_format(other.to_string())),
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::WebP => "webp",
        }
    }

    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::WebP => "image/webp",
        }
    }

    /// Whether the format has a quality knob (and can be size-governed).
    pub fn is_lossy(&self) -> bool {
        matches!(self, OutputFormat::Jpeg | OutputFormat::WebP)
    }
}
