//! Conversion between the user-facing 0-100 slider percentage and a device's
//! native brightness encoding.
//!
//! Conversions run in two layers. A [`BrightnessCurve`] maps a percentage to a
//! normalized linear level in `[0, 1]` and back; a [`NativeScale`] then places
//! that level inside a device's [`BrightnessRange`] and rounds it to an integer.
//! The level layer is exact to within one percent for every curve. The native
//! layer inherits the resolution of the device range.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Static fallback used when the device range cannot be resolved
pub const DEFAULT_RANGE: BrightnessRange = BrightnessRange {
    minimum: 0,
    maximum: 255,
};

// Hybrid Log-Gamma constants matching the platform's own slider curve
const HLG_R: f64 = 0.5;
const HLG_A: f64 = 0.17883277;
const HLG_B: f64 = 0.28466892;
const HLG_C: f64 = 0.55991073;

// Observed slider pairs on the newest platform generation: device percent (x)
// against the app percent that produces it (y)
const REMAP_DEVICE_POINTS: [u8; 10] = [0, 20, 37, 50, 60, 70, 79, 89, 99, 100];
const REMAP_APP_POINTS: [u8; 10] = [0, 20, 30, 40, 50, 60, 70, 80, 90, 100];

/// Device-specific native bounds. `maximum > minimum` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrightnessRange {
    minimum: u32,
    maximum: u32,
}

impl BrightnessRange {
    /// Create a range, rejecting empty or inverted bounds
    pub fn new(minimum: u32, maximum: u32) -> Option<Self> {
        (maximum > minimum).then_some(Self { minimum, maximum })
    }

    /// Resolve a range from possibly-missing system values.
    ///
    /// Missing bounds default to `0`/`255`, a negative minimum clamps to zero,
    /// and anything that leaves an empty or inverted range falls back to
    /// [`DEFAULT_RANGE`].
    pub fn resolve(minimum: Option<i64>, maximum: Option<i64>) -> Self {
        let min = minimum.unwrap_or(DEFAULT_RANGE.minimum as i64).max(0);
        let max = maximum.unwrap_or(DEFAULT_RANGE.maximum as i64);

        if max <= min || max > u32::MAX as i64 {
            return DEFAULT_RANGE;
        }

        Self {
            minimum: min as u32,
            maximum: max as u32,
        }
    }

    pub fn minimum(&self) -> u32 {
        self.minimum
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    pub fn span(&self) -> u32 {
        self.maximum - self.minimum
    }

    /// Clamp an arbitrary native reading into the range
    pub fn clamp(&self, value: i64) -> u32 {
        value.clamp(self.minimum as i64, self.maximum as i64) as u32
    }
}

impl Default for BrightnessRange {
    fn default() -> Self {
        DEFAULT_RANGE
    }
}

impl fmt::Display for BrightnessRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.minimum, self.maximum)
    }
}

/// Platform generation, as far as brightness encoding is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformGeneration {
    /// No gamma concept; the slider maps linearly onto the native range
    Legacy,
    /// Gamma-corrected slider
    Gamma,
    /// Gamma-corrected slider whose curve drifts from HLG and needs a remap
    RemappedSlider,
}

/// What the host platform can tell us about its brightness encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub generation: PlatformGeneration,
    /// The platform exposes its own perceptual gamma implementation
    pub native_gamma: bool,
}

/// Curve models for percent <-> linear level conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrightnessCurve {
    Linear,
    /// Gamma 2.0 approximation of the perceptual curve
    Quadratic,
    /// Hybrid Log-Gamma, identical to the platform slider
    Perceptual,
    /// HLG preceded by the device slider remap table
    RemappedPerceptual,
}

impl BrightnessCurve {
    /// Pick the best curve for the platform
    pub fn resolve(caps: PlatformCapabilities) -> Self {
        match caps.generation {
            PlatformGeneration::Legacy => BrightnessCurve::Linear,
            PlatformGeneration::RemappedSlider => BrightnessCurve::RemappedPerceptual,
            PlatformGeneration::Gamma if caps.native_gamma => BrightnessCurve::Perceptual,
            PlatformGeneration::Gamma => BrightnessCurve::Quadratic,
        }
    }

    /// Convert a slider percentage to a linear level in `[0, 1]`
    pub fn percent_to_level(self, percent: i32) -> f64 {
        let percent = clamp_percent(percent);

        match self {
            BrightnessCurve::Linear => percent as f64 / 100.0,
            BrightnessCurve::Quadratic => {
                let normalized = percent as f64 / 100.0;
                normalized * normalized
            }
            BrightnessCurve::Perceptual => hlg_gamma_to_linear(percent as f64 / 100.0),
            BrightnessCurve::RemappedPerceptual => {
                let adjusted = slider_to_app_percent(percent);
                hlg_gamma_to_linear(adjusted as f64 / 100.0)
            }
        }
    }

    /// Convert a linear level back to a slider percentage
    pub fn level_to_percent(self, level: f64) -> u8 {
        let level = clamp01(level);

        match self {
            BrightnessCurve::Linear => round_percent(level),
            BrightnessCurve::Quadratic => round_percent(level.sqrt()),
            BrightnessCurve::Perceptual => round_percent(hlg_linear_to_gamma(level)),
            BrightnessCurve::RemappedPerceptual => {
                app_to_slider_percent(round_percent(hlg_linear_to_gamma(level)))
            }
        }
    }
}

impl fmt::Display for BrightnessCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrightnessCurve::Linear => "linear",
            BrightnessCurve::Quadratic => "quadratic",
            BrightnessCurve::Perceptual => "perceptual",
            BrightnessCurve::RemappedPerceptual => "remapped-perceptual",
        };
        f.write_str(name)
    }
}

/// A curve bound to a concrete native range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeScale {
    pub curve: BrightnessCurve,
    pub range: BrightnessRange,
}

impl NativeScale {
    pub fn new(curve: BrightnessCurve, range: BrightnessRange) -> Self {
        Self { curve, range }
    }

    /// `percentToNative`: clamp, apply curve, scale into range, round, clamp
    pub fn percent_to_native(&self, percent: i32) -> u32 {
        let level = self.curve.percent_to_level(percent);
        let native = self.range.minimum as f64 + level * self.range.span() as f64;
        self.range.clamp(native.round() as i64)
    }

    /// `nativeToPercent`: clamp input to range, normalize, invert the curve
    pub fn native_to_percent(&self, native: i64) -> u8 {
        let clamped = self.range.clamp(native);
        let level = (clamped - self.range.minimum) as f64 / self.range.span() as f64;
        self.curve.level_to_percent(level)
    }

    /// Linear level for a percentage, used for window-level overrides
    pub fn percent_to_level(&self, percent: i32) -> f64 {
        self.curve.percent_to_level(percent)
    }
}

/// Clamp a caller-supplied percentage into `0..=100`
pub fn clamp_percent(percent: i32) -> u8 {
    percent.clamp(0, 100) as u8
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn round_percent(normalized: f64) -> u8 {
    (clamp01(normalized) * 100.0).round() as u8
}

/// HLG gamma-domain value to linear level
pub fn hlg_gamma_to_linear(gamma: f64) -> f64 {
    if gamma <= 0.0 {
        return 0.0;
    }

    let linear = if gamma <= HLG_R {
        let scaled = gamma / HLG_R;
        scaled * scaled / 12.0
    } else {
        (((gamma - HLG_C) / HLG_A).exp() + HLG_B) / 12.0
    };

    clamp01(linear)
}

/// Linear level to HLG gamma-domain value
pub fn hlg_linear_to_gamma(linear: f64) -> f64 {
    if linear <= 0.0 {
        return 0.0;
    }

    let gamma = if linear <= 1.0 / 12.0 {
        (linear * 12.0).sqrt() * HLG_R
    } else {
        HLG_A * (12.0 * linear - HLG_B).ln() + HLG_C
    };

    clamp01(gamma)
}

/// Percentage the app must request so the device slider shows `desired`
pub fn slider_to_app_percent(desired: u8) -> u8 {
    interpolate(desired, &REMAP_DEVICE_POINTS, &REMAP_APP_POINTS)
}

/// Device slider percentage produced by requesting `app` percent
pub fn app_to_slider_percent(app: u8) -> u8 {
    interpolate(app, &REMAP_APP_POINTS, &REMAP_DEVICE_POINTS)
}

/// Piecewise-linear interpolation over a monotonic control-point table.
/// Values outside the table clamp to the nearest endpoint.
fn interpolate(value: u8, xs: &[u8], ys: &[u8]) -> u8 {
    let value = value.min(100);

    let (Some(&first_x), Some(&first_y), Some(&last_y)) = (xs.first(), ys.first(), ys.last())
    else {
        return value;
    };

    if value <= first_x {
        return first_y;
    }

    for i in 1..xs.len().min(ys.len()) {
        if value <= xs[i] {
            let (x0, x1) = (xs[i - 1] as f64, xs[i] as f64);
            let (y0, y1) = (ys[i - 1] as f64, ys[i] as f64);
            let t = if x1 == x0 {
                0.0
            } else {
                (value as f64 - x0) / (x1 - x0)
            };
            return (y0 + t * (y1 - y0)).round() as u8;
        }
    }

    last_y
}
