use std::time::Duration;
use tracing::{debug, warn};
use vconv_core::{BufferInfo, ConvertError, MediaFormat, Result};

use super::{CodecState, Dequeue};
use crate::surface::Surface;

/// Native decoder operations, in the order a decoder expects them.
pub trait DecoderBackend {
    /// Prepare for `format`, rendering decoded frames onto `surface`.
    fn configure(&mut self, format: &MediaFormat, surface: Surface) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    /// Wait up to `timeout` for a free input slot.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>>;
    /// Writable storage of a dequeued input slot.
    fn input_buffer(&mut self, index: usize) -> Result<&mut Vec<u8>>;
    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<()>;
    /// Return a dequeued slot without submitting it.
    fn cancel_input_buffer(&mut self, index: usize);
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// A decoder with an enforced lifecycle:
/// `Unconfigured -> Configured -> Started -> Stopped -> Released`.
pub struct Decoder<B: DecoderBackend> {
    backend: B,
    state: CodecState,
    input_eos: bool,
}

impl<B: DecoderBackend> Decoder<B> {
    /// Wrap an unconfigured backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: CodecState::Unconfigured,
            input_eos: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CodecState {
        self.state
    }

    /// Whether the end-of-stream marker has been submitted.
    pub fn input_eos(&self) -> bool {
        self.input_eos
    }

    fn require(&self, expected: CodecState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConvertError::invalid_state("decoder", operation, self.state))
        }
    }

    /// Configure for `format`, rendering decoded frames onto `surface`.
    pub fn configure(&mut self, format: &MediaFormat, surface: Surface) -> Result<()> {
        self.require(CodecState::Unconfigured, "configure")?;
        self.backend.configure(format, surface)?;
        self.state = CodecState::Configured;
        debug!(mime = %format.mime, "decoder configured");
        Ok(())
    }

    /// Start decoding. Requires a configured decoder.
    pub fn start(&mut self) -> Result<()> {
        self.require(CodecState::Configured, "start")?;
        self.backend.start()?;
        self.state = CodecState::Started;
        debug!("decoder started");
        Ok(())
    }

    /// Wait up to `timeout` for an input slot.
    pub fn poll_input_slot(&mut self, timeout: Duration) -> Result<Dequeue<InputSlot<'_, B>>> {
        self.require(CodecState::Started, "dequeue input")?;
        if self.input_eos {
            return Err(ConvertError::invalid_state(
                "decoder",
                "dequeue input",
                "EndOfStreamSubmitted",
            ));
        }
        Ok(match self.backend.dequeue_input_buffer(timeout)? {
            Some(index) => Dequeue::Ready(InputSlot {
                decoder: self,
                index,
                consumed: false,
            }),
            None => Dequeue::Again,
        })
    }

    /// Stop a started decoder.
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

impl<B: DecoderBackend> Drop for Decoder<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "decoder release on drop failed");
        }
    }
}

/// A dequeued decoder input slot. Dropping it unsubmitted returns the slot.
pub struct InputSlot<'a, B: DecoderBackend> {
    decoder: &'a mut Decoder<B>,
    index: usize,
    consumed: bool,
}

impl<B: DecoderBackend> InputSlot<'_, B> {
    /// Backend slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Storage to fill with one compressed sample.
    pub fn buffer(&mut self) -> Result<&mut Vec<u8>> {
        self.decoder.backend.input_buffer(self.index)
    }

    /// Queue the filled buffer for decoding.
    pub fn submit(mut self, info: BufferInfo) -> Result<()> {
        self.consumed = true;
        self.decoder.backend.queue_input_buffer(self.index, info)?;
        if info.is_end_of_stream() {
            self.decoder.input_eos = true;
        }
        Ok(())
    }

    /// Queue an empty end-of-stream marker.
    pub fn submit_end_of_stream(mut self, presentation_time_us: i64) -> Result<()> {
        if let Ok(buf) = self.buffer() {
            buf.clear();
        }
        self.submit(BufferInfo::end_of_stream(presentation_time_us))
    }
}

impl<B: DecoderBackend> Drop for InputSlot<'_, B> {
    fn drop(&mut self) {
        if !self.consumed {
            self.decoder.backend.cancel_input_buffer(self.index);
        }
    }
}
