//! Per-sample metadata exchanged between demuxer, codecs and muxer.

use bitflags::bitflags;

bitflags! {
    /// Flags attached to one sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// The sample is a sync point.
        const KEY_FRAME = 0x0001;
        /// The sample carries codec setup data, not media payload.
        const CODEC_CONFIG = 0x0002;
        /// No further samples follow on this stream.
        const END_OF_STREAM = 0x0004;
    }
}

/// Muxing metadata for one sample: where its payload lives inside the slot
/// buffer, when it is presented and how it is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Start of the payload within the buffer.
    pub offset: usize,
    /// Payload length in bytes.
    pub size: usize,
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    /// Describe `size` bytes at `offset`.
    pub fn new(offset: usize, size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            offset,
            size,
            presentation_time_us,
            flags,
        }
    }

    /// An empty end-of-stream marker.
    pub fn end_of_stream(presentation_time_us: i64) -> Self {
        Self::new(0, 0, presentation_time_us, BufferFlags::END_OF_STREAM)
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    #[inline]
    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    #[inline]
    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    /// Byte range of the payload.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}
