//! Track formats as seen by the demuxer, codecs and muxer.

use serde::{Deserialize, Serialize};

use crate::time::FrameRate;

/// Well-known media type strings.
pub mod mime {
    /// H.264 / AVC video.
    pub const VIDEO_AVC: &str = "video/avc";
    /// H.265 / HEVC video.
    pub const VIDEO_HEVC: &str = "video/hevc";
    /// AAC audio.
    pub const AUDIO_AAC: &str = "audio/mp4a-latm";
    /// Anything the container does not describe.
    pub const UNKNOWN: &str = "application/octet-stream";

    /// Prefix matching every video track.
    pub const VIDEO_PREFIX: &str = "video/";
}

/// Pixel layout a codec exchanges frames in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    /// Frames are handed over through a shared rendering surface; the codec
    /// picks the concrete layout.
    Surface,
    /// YUV 4:2:0 planar.
    Yuv420Planar,
}

/// Out-of-band codec setup data (H.264 parameter sets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Sequence parameter sets, without start codes.
    pub sps: Vec<Vec<u8>>,
    /// Picture parameter sets, without start codes.
    pub pps: Vec<Vec<u8>>,
    /// Size in bytes of the NAL length prefix in samples (1, 2 or 4).
    pub nal_length_size: u8,
}

impl CodecConfig {
    /// Whether at least one SPS and one PPS are present.
    pub fn is_complete(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }
}

/// Format parameters of one elementary stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    /// Media type, e.g. `video/avc`.
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bits per second.
    pub bit_rate: Option<u32>,
    pub frame_rate: Option<FrameRate>,
    /// Track duration in microseconds.
    pub duration_us: Option<i64>,
    /// Seconds between key frames requested from an encoder.
    pub keyframe_interval_secs: Option<u32>,
    pub color_format: Option<ColorFormat>,
    #[serde(skip)]
    pub codec_config: Option<CodecConfig>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
}

impl MediaFormat {
    /// An otherwise empty format for the given media type.
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            width: None,
            height: None,
            bit_rate: None,
            frame_rate: None,
            duration_us: None,
            keyframe_interval_secs: None,
            color_format: None,
            codec_config: None,
            sample_rate: None,
            channel_count: None,
        }
    }

    /// A video format with the given dimensions.
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::new(mime)
        }
    }

    /// Whether the mime type is a video type.
    pub fn is_video(&self) -> bool {
        self.mime.starts_with(mime::VIDEO_PREFIX)
    }

    /// Width and height, if both are known.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// A track of a container together with its index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub index: usize,
    pub format: MediaFormat,
}
