//! Conversion progress from written sample timestamps.

/// Turns presentation timestamps of written samples into a progress
/// fraction of the source duration.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_us: Option<i64>,
    reported: Option<f32>,
}

impl ProgressTracker {
    /// Progress over a source of `duration_us`. Unknown or non-positive
    /// durations produce no progress reports.
    pub fn new(duration_us: Option<i64>) -> Self {
        Self {
            duration_us: duration_us.filter(|&d| d > 0),
            reported: None,
        }
    }

    /// Fraction in `[0, 1]` after a sample at `presentation_time_us` was
    /// written. Never lower than a previously returned value.
    pub fn update(&mut self, presentation_time_us: i64) -> Option<f32> {
        let duration = self.duration_us?;
        let fraction = (presentation_time_us as f64 / duration as f64).clamp(0.0, 1.0) as f32;
        let fraction = self.reported.map_or(fraction, |last| last.max(fraction));
        self.reported = Some(fraction);
        Some(fraction)
    }

    /// The most recently reported fraction.
    pub fn last(&self) -> Option<f32> {
        self.reported
    }
}
