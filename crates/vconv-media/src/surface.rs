//! Shared rendering target between the decoder and the encoder.
//!
//! The decoder renders decoded frames onto the surface and the encoder
//! consumes them. The pipeline itself never touches raw frame memory; it
//! only wires the encoder's input surface into the decoder at configure
//! time. The queue is bounded, so a decoder that runs ahead of the encoder
//! blocks in [`Surface::render`].

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use vconv_core::{ConvertError, RawFrame, Result};

/// Default number of frames in flight between decoder and encoder.
pub const DEFAULT_SURFACE_CAPACITY: usize = 4;

/// How often blocked producers and consumers re-check for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Message travelling over the surface.
#[derive(Debug)]
pub enum SurfaceFrame {
    Frame(RawFrame),
    /// The producer will render no further frames.
    EndOfStream,
}

/// A bounded frame queue shared by one producer and one consumer.
#[derive(Debug, Clone)]
pub struct Surface {
    tx: Sender<SurfaceFrame>,
    rx: Receiver<SurfaceFrame>,
    closed: Arc<AtomicBool>,
    width: u32,
    height: u32,
}

impl Surface {
    /// Create a surface for frames of the given size.
    pub fn new(width: u32, height: u32, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
            width,
            height,
        }
    }

    /// Frame width and height.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Queue a frame, blocking while the surface is full.
    pub fn render(&self, frame: RawFrame) -> Result<()> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(ConvertError::Codec(format!(
                "Frame of {}x{} rendered onto {}x{} surface",
                frame.width, frame.height, self.width, self.height
            )));
        }
        trace!(pts_us = frame.pts_us, "render frame");
        self.send(SurfaceFrame::Frame(frame))
    }

    /// Mark the end of the frame stream.
    pub fn signal_end_of_stream(&self) -> Result<()> {
        self.send(SurfaceFrame::EndOfStream)
    }

    fn send(&self, mut msg: SurfaceFrame) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(ConvertError::Codec("Surface closed".into()));
            }
            match self.tx.send_timeout(msg, SHUTDOWN_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => msg = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(ConvertError::Codec("Surface disconnected".into()))
                }
            }
        }
    }

    /// Take the next message, blocking until one arrives. Returns `None`
    /// once the surface is closed.
    pub fn acquire(&self) -> Option<SurfaceFrame> {
        loop {
            if self.is_closed() {
                return None;
            }
            match self.rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(msg) => return Some(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Wake every blocked producer and consumer and reject further use.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the surface was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames currently queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
