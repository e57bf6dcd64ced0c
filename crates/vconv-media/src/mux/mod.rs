//! Container writing.

pub mod atoms;
pub mod mp4;
mod writer;

pub use writer::Mp4Writer;

use tracing::{debug, warn};
use vconv_core::{BufferInfo, ConvertError, MediaFormat, Result};

/// A container format backend driven by [`Muxer`].
pub trait ContainerWriter {
    /// Register a track and return its index.
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize>;
    fn start(&mut self) -> Result<()>;
    /// Append one sample. `data` is exactly the payload described by `info`.
    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()>;
    /// Finalize the container index.
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Lifecycle of a [`Muxer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    Idle,
    TrackAdded,
    Writing,
    Stopped,
    Released,
}

/// Enforces the add-track, start, write, stop ordering on a
/// [`ContainerWriter`].
pub struct Muxer<W: ContainerWriter> {
    writer: W,
    state: MuxerState,
    track: Option<usize>,
    last_pts_us: Option<i64>,
    samples_written: u64,
    started: bool,
}

impl<W: ContainerWriter> Muxer<W> {
    /// Wrap a container writer. Nothing is written until [`start`](Self::start).
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: MuxerState::Idle,
            track: None,
            last_pts_us: None,
            samples_written: 0,
            started: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MuxerState {
        self.state
    }

    /// Whether `start` succeeded at some point, i.e. output may exist.
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Number of samples accepted so far.
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Get the wrapped writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn usage(&self, operation: &str) -> ConvertError {
        ConvertError::MuxerUsage(format!("cannot {operation} in state {:?}", self.state))
    }

    /// Register the single output track. Only valid before `start`.
    pub fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        if self.state != MuxerState::Idle {
            return Err(self.usage("add track"));
        }
        let index = self.writer.add_track(format)?;
        self.track = Some(index);
        self.state = MuxerState::TrackAdded;
        debug!(index, mime = %format.mime, "muxer track added");
        Ok(index)
    }

    /// Open the output for writing.
    pub fn start(&mut self) -> Result<()> {
        if self.state != MuxerState::TrackAdded {
            return Err(self.usage("start"));
        }
        self.writer.start()?;
        self.started = true;
        self.state = MuxerState::Writing;
        debug!("muxer started");
        Ok(())
    }

    /// Write one media sample. Timestamps must not decrease.
    pub fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()> {
        if self.state != MuxerState::Writing {
            return Err(self.usage("write sample"));
        }
        if Some(track) != self.track {
            return Err(ConvertError::MuxerUsage(format!("unknown track {track}")));
        }
        if data.is_empty() || data.len() != info.size {
            return Err(ConvertError::MuxerUsage(format!(
                "payload of {} bytes does not match sample size {}",
                data.len(),
                info.size
            )));
        }
        if info.is_codec_config() {
            return Err(ConvertError::MuxerUsage(
                "codec configuration belongs to the track format".into(),
            ));
        }
        if let Some(last) = self.last_pts_us {
            if info.presentation_time_us < last {
                return Err(ConvertError::MuxerUsage(format!(
                    "timestamp {} us precedes previous sample at {last} us",
                    info.presentation_time_us
                )));
            }
        }

        self.writer.write_sample(track, data, info)?;
        self.last_pts_us = Some(info.presentation_time_us);
        self.samples_written += 1;
        Ok(())
    }

    /// Finalize the output. Only valid while writing.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != MuxerState::Writing {
            return Err(self.usage("stop"));
        }
        // A failed finalize leaves nothing to retry.
        self.state = MuxerState::Stopped;
        self.writer.stop()?;
        debug!(samples = self.samples_written, "muxer stopped");
        Ok(())
    }

    /// Release the container backend. Later calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if self.state == MuxerState::Released {
            return Ok(());
        }
        self.state = MuxerState::Released;
        self.writer.release()?;
        debug!("muxer released");
        Ok(())
    }
}

impl<W: ContainerWriter> Drop for Muxer<W> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "muxer release failed during drop");
        }
    }
}
