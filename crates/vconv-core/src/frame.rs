//! Raw decoded frames handed from the decoder to the encoder.

use serde::{Deserialize, Serialize};

/// Pixel format of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar, 8 bits per sample
    #[default]
    Yuv420P,
}

impl PixelFormat {
    /// Calculate total bytes needed for a frame of this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let y_size = width as usize * height as usize;
        let chroma_w = (width as usize).div_ceil(2);
        let chroma_h = (height as usize).div_ceil(2);
        match self {
            Self::Yuv420P => y_size + 2 * chroma_w * chroma_h,
        }
    }

    /// Name of the format as ffmpeg spells it.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Yuv420P => "yuv420p",
        }
    }
}

/// A decoded video frame in CPU memory, tightly packed.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Wrap `data`, which must hold exactly one frame of `format`.
    pub fn new(format: PixelFormat, width: u32, height: u32, pts_us: i64, data: Vec<u8>) -> Option<Self> {
        if data.len() != format.frame_size(width, height) {
            return None;
        }
        Some(Self {
            format,
            width,
            height,
            pts_us,
            data,
        })
    }

    /// A black frame (Y = 16, U = V = 128 for YUV formats).
    pub fn black(format: PixelFormat, width: u32, height: u32, pts_us: i64) -> Self {
        let y_size = width as usize * height as usize;
        let mut data = vec![128u8; format.frame_size(width, height)];
        data[..y_size].fill(16);
        Self {
            format,
            width,
            height,
            pts_us,
            data,
        }
    }
}
