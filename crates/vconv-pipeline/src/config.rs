//! Converter configuration.
//!
//! Loaded from JSON; every field is optional in the file and falls back to
//! its default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vconv_core::{ConvertError, Result};

/// Tunables for one [`VideoConverter`](crate::VideoConverter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Bounded wait of each feed/drain poll.
    pub poll_timeout_ms: u64,
    /// Key frame interval requested from the encoder.
    pub keyframe_interval_secs: u32,
    /// Frames in flight between decoder and encoder.
    pub surface_capacity: usize,
    /// Decoder input slots.
    pub input_slots: usize,
    /// Fail when neither stage makes progress for this long.
    pub stall_timeout_ms: u64,
    /// Destination directory; the platform movies directory when unset.
    pub output_dir: Option<PathBuf>,
    /// ffmpeg binary; located by ffmpeg-sidecar when unset.
    pub ffmpeg_path: Option<PathBuf>,
    /// libx264 speed preset.
    pub encoder_preset: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            keyframe_interval_secs: 1,
            surface_capacity: 4,
            input_slots: 4,
            stall_timeout_ms: 30_000,
            output_dir: None,
            ffmpeg_path: None,
            encoder_preset: "medium".to_string(),
        }
    }
}

const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

impl ConverterConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| ConvertError::Config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConvertError::Config(format!("Failed to serialize configuration: {e}")))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("keyframe_interval_secs", self.keyframe_interval_secs as u64),
            ("surface_capacity", self.surface_capacity as u64),
            ("input_slots", self.input_slots as u64),
            ("stall_timeout_ms", self.stall_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConvertError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.stall_timeout_ms < self.poll_timeout_ms {
            return Err(ConvertError::Config(format!(
                "stall_timeout_ms ({}) is shorter than poll_timeout_ms ({})",
                self.stall_timeout_ms, self.poll_timeout_ms
            )));
        }
        if !PRESETS.contains(&self.encoder_preset.as_str()) {
            return Err(ConvertError::Config(format!(
                "Unknown encoder preset '{}'",
                self.encoder_preset
            )));
        }
        Ok(())
    }

    /// Codec dequeue timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Idle time after which the run fails as stalled.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}
