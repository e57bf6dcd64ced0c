//! Container demultiplexing.

pub mod mp4;

use vconv_core::{MediaFormat, Result};

pub use mp4::Mp4Demuxer;

/// Metadata of the sample most recently read by [`Demuxer::read_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMeta {
    /// Payload length in bytes.
    pub size: usize,
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: i64,
    pub key_frame: bool,
}

/// Reads compressed samples of one selected track, in decode order.
pub trait Demuxer {
    fn track_count(&self) -> usize;
    fn track_format(&self, index: usize) -> Result<MediaFormat>;
    /// Restrict reading to the given track.
    fn select_track(&mut self, index: usize) -> Result<()>;
    /// Copy the current sample into `buf` without advancing. `None` once
    /// every sample of the selected track has been read.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>>;
    /// Move to the next sample. Returns false when none remain.
    fn advance(&mut self) -> bool;
    fn release(&mut self) -> Result<()>;
}
