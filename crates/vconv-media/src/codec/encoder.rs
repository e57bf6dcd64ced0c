use std::time::Duration;
use tracing::{debug, warn};
use vconv_core::{BufferInfo, ConvertError, MediaFormat, Result};

use super::{CodecState, Dequeue};
use crate::surface::Surface;

/// Native encoder operations, in the order an encoder expects them.
pub trait EncoderBackend {
    fn configure(&mut self, format: &MediaFormat) -> Result<()>;
    /// The surface the encoder reads its input frames from.
    fn create_input_surface(&mut self) -> Result<Surface>;
    fn start(&mut self) -> Result<()>;
    /// Wait up to `timeout` for a filled output slot.
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<Option<(usize, BufferInfo)>>;
    fn output_buffer(&self, index: usize) -> Result<&[u8]>;
    /// The negotiated output format, once output has begun.
    fn output_format(&self) -> Option<MediaFormat>;
    fn release_output_buffer(&mut self, index: usize) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// An encoder with an enforced lifecycle:
/// `Unconfigured -> Configured -> Started -> Stopped -> Released`.
pub struct Encoder<B: EncoderBackend> {
    backend: B,
    state: CodecState,
    has_surface: bool,
    output_eos: bool,
}

impl<B: EncoderBackend> Encoder<B> {
    /// Wrap an unconfigured backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: CodecState::Unconfigured,
            has_surface: false,
            output_eos: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CodecState {
        self.state
    }

    /// Whether the end-of-stream output has been dequeued.
    pub fn output_eos(&self) -> bool {
        self.output_eos
    }

    fn require(&self, expected: CodecState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConvertError::invalid_state("encoder", operation, self.state))
        }
    }

    /// Configure the output format.
    pub fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        self.require(CodecState::Unconfigured, "configure")?;
        self.backend.configure(format)?;
        self.state = CodecState::Configured;
        debug!(mime = %format.mime, bit_rate = ?format.bit_rate, "encoder configured");
        Ok(())
    }

    /// Obtain the input surface. Valid once, between configure and start.
    pub fn create_input_surface(&mut self) -> Result<Surface> {
        self.require(CodecState::Configured, "create input surface")?;
        if self.has_surface {
            return Err(ConvertError::invalid_state(
                "encoder",
                "create input surface",
                "SurfaceCreated",
            ));
        }
        let surface = self.backend.create_input_surface()?;
        self.has_surface = true;
        Ok(surface)
    }

    /// Start encoding. Requires a configured encoder with an input surface.
    pub fn start(&mut self) -> Result<()> {
        self.require(CodecState::Configured, "start")?;
        self.backend.start()?;
        self.state = CodecState::Started;
        debug!("encoder started");
        Ok(())
    }

    /// Wait up to `timeout` for an encoded output slot.
    pub fn poll_output_slot(&mut self, timeout: Duration) -> Result<Dequeue<OutputSlot<'_, B>>> {
        self.require(CodecState::Started, "dequeue output")?;
        if self.output_eos {
            return Err(ConvertError::invalid_state(
                "encoder",
                "dequeue output",
                "EndOfStreamReached",
            ));
        }
        Ok(match self.backend.dequeue_output_buffer(timeout)? {
            Some((index, info)) => {
                if info.is_end_of_stream() {
                    self.output_eos = true;
                }
                Dequeue::Ready(OutputSlot {
                    encoder: self,
                    index,
                    info,
                    released: false,
                })
            }
            None => Dequeue::Again,
        })
    }

    /// The finally negotiated output format.
    pub fn output_format(&self) -> Result<MediaFormat> {
        self.backend
            .output_format()
            .ok_or_else(|| ConvertError::Codec("Encoder output format not yet negotiated".into()))
    }

    /// Stop a started encoder.
    pub fn stop(&mut self) -> Result<()> {
        self.require(CodecState::Started, "stop")?;
        self.backend.stop()?;
        self.state = CodecState::Stopped;
        Ok(())
    }

    /// Release native resources. Later calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if self.state == CodecState::Released {
            return Ok(());
        }
        self.state = CodecState::Released;
        self.backend.release()
    }

    /// Get the wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: EncoderBackend> Drop for Encoder<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "encoder release on drop failed");
        }
    }
}

/// A dequeued encoder output slot. Dropping it releases the slot.
pub struct OutputSlot<'a, B: EncoderBackend> {
    encoder: &'a mut Encoder<B>,
    index: usize,
    info: BufferInfo,
    released: bool,
}

impl<B: EncoderBackend> OutputSlot<'_, B> {
    /// Backend slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size, timestamp and flags of the encoded sample.
    pub fn info(&self) -> BufferInfo {
        self.info
    }

    /// The encoded payload described by [`info`](Self::info).
    pub fn data(&self) -> Result<&[u8]> {
        let buf = self.encoder.backend.output_buffer(self.index)?;
        buf.get(self.info.range()).ok_or_else(|| {
            ConvertError::Codec(format!(
                "Output range {:?} exceeds buffer of {} bytes",
                self.info.range(),
                buf.len()
            ))
        })
    }

    /// Mark the slot as carrying no muxable payload.
    pub fn clear_payload(&mut self) {
        self.info.size = 0;
    }

    /// Hand the slot back to the encoder.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.encoder.backend.release_output_buffer(self.index)
    }

    /// The encoder this slot belongs to.
    pub fn encoder(&self) -> &Encoder<B> {
        self.encoder
    }
}

impl<B: EncoderBackend> Drop for OutputSlot<'_, B> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.encoder.backend.release_output_buffer(self.index) {
                warn!(index = self.index, error = %e, "output slot release failed");
            }
        }
    }
}
