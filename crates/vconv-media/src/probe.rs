//! Media file probing to get metadata without decoding.

use serde::{Deserialize, Serialize};
use std::path::Path;
use vconv_core::{FrameRate, Result};

use crate::demux::Mp4Demuxer;

/// Information about a media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaProbe {
    /// File path
    pub path: String,
    /// Container duration in microseconds
    pub duration_us: Option<i64>,
    /// Video streams
    pub video_streams: Vec<VideoStreamInfo>,
    /// Audio streams
    pub audio_streams: Vec<AudioStreamInfo>,
    /// Tracks of any other kind
    pub other_streams: Vec<OtherStreamInfo>,
    /// Container format
    pub format: String,
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<FrameRate>,
    pub bit_rate: Option<u32>,
    pub duration_us: Option<i64>,
    pub sample_count: usize,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bit_rate: Option<u32>,
}

/// A track that is neither audio nor video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtherStreamInfo {
    pub index: usize,
    pub codec: String,
}

impl MediaProbe {
    /// Probe an MP4/MOV file.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let demuxer = Mp4Demuxer::open(path)?;

        let mut probe = Self {
            path: path.to_string_lossy().into_owned(),
            duration_us: demuxer.duration_us(),
            video_streams: Vec::new(),
            audio_streams: Vec::new(),
            other_streams: Vec::new(),
            format: "mp4".to_string(),
        };

        for track in demuxer.tracks() {
            let format = track.format;
            if format.is_video() {
                probe.video_streams.push(VideoStreamInfo {
                    index: track.index,
                    codec: format.mime,
                    width: format.width,
                    height: format.height,
                    frame_rate: format.frame_rate,
                    bit_rate: format.bit_rate,
                    duration_us: format.duration_us,
                    sample_count: demuxer.sample_count(track.index).unwrap_or(0),
                });
            } else if format.mime.starts_with("audio/") {
                probe.audio_streams.push(AudioStreamInfo {
                    index: track.index,
                    codec: format.mime,
                    sample_rate: format.sample_rate,
                    channels: format.channel_count,
                    bit_rate: format.bit_rate,
                });
            } else {
                probe.other_streams.push(OtherStreamInfo {
                    index: track.index,
                    codec: format.mime,
                });
            }
        }

        Ok(probe)
    }

    /// Check if the file has video.
    pub fn has_video(&self) -> bool {
        !self.video_streams.is_empty()
    }

    /// Check if the file has audio.
    pub fn has_audio(&self) -> bool {
        !self.audio_streams.is_empty()
    }

    /// Get the primary video stream info.
    pub fn primary_video(&self) -> Option<&VideoStreamInfo> {
        self.video_streams.first()
    }

    /// Get the primary audio stream info.
    pub fn primary_audio(&self) -> Option<&AudioStreamInfo> {
        self.audio_streams.first()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| vconv_core::ConvertError::Container(format!("Cannot serialize probe: {e}")))
    }
}
