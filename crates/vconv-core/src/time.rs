//! Timing primitives.
//!
//! Presentation timestamps travel through the pipeline as microseconds
//! (`i64`), the unit the muxer metadata and progress computation use.
//! Container timescales are converted at the edges with integer arithmetic
//! so no rounding drift accumulates over long files.

use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Microseconds in one second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Convert a tick count in `timescale` units to microseconds (floor).
#[inline]
pub fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (ticks as i128 * MICROS_PER_SECOND as i128 / timescale as i128) as i64
}

/// Convert microseconds to a tick count in `timescale` units (rounded).
#[inline]
pub fn micros_to_ticks(micros: i64, timescale: u32) -> i64 {
    let scaled = micros as i128 * timescale as i128;
    let half = MICROS_PER_SECOND as i128 / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / MICROS_PER_SECOND as i128
    } else {
        (scaled - half) / MICROS_PER_SECOND as i128
    };
    rounded as i64
}

/// Frame rate as a rational number (e.g., 24000/1001 for 23.976 fps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    /// Numerator (e.g., 24000)
    pub numerator: u32,
    /// Denominator (e.g., 1001)
    pub denominator: u32,
}

impl FrameRate {
    /// Create a new frame rate.
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Derive the average frame rate of a track from its sample count and
    /// media duration. Returns `None` when either is zero.
    pub fn from_sample_timing(sample_count: u64, duration_ticks: u64, timescale: u32) -> Option<Self> {
        if sample_count == 0 || duration_ticks == 0 || timescale == 0 {
            return None;
        }
        let mut ratio = Ratio::new(sample_count * timescale as u64, duration_ticks);
        // Keep both halves in u32 range; precision past 1/1000 fps is noise.
        while *ratio.numer() > u32::MAX as u64 || *ratio.denom() > u32::MAX as u64 {
            ratio = Ratio::new(*ratio.numer() / 2 + 1, (*ratio.denom() / 2).max(1));
        }
        Some(Self::new(*ratio.numer() as u32, *ratio.denom() as u32))
    }

    /// Convert to frames per second as f64.
    #[inline]
    pub fn to_fps_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Nearest whole frames per second, never below 1.
    #[inline]
    pub fn rounded_fps(self) -> u32 {
        (self.to_fps_f64().round() as u32).max(1)
    }

    /// Duration of a single frame in microseconds.
    #[inline]
    pub fn frame_duration_us(self) -> i64 {
        if self.numerator == 0 {
            return 0;
        }
        self.denominator as i64 * MICROS_PER_SECOND / self.numerator as i64
    }

    /// Common frame rates
    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fps = self.to_fps_f64();
        if (fps - fps.round()).abs() < 0.001 {
            write!(f, "{} fps", fps.round() as u32)
        } else {
            write!(f, "{:.3} fps", fps)
        }
    }
}
