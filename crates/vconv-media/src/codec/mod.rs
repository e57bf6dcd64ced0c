//! Codec lifecycle wrappers.
//!
//! [`Decoder`] and [`Encoder`] wrap a native codec backend in an explicit
//! state machine. Buffer slots are handed out as guards that borrow the
//! codec, so a slot cannot outlive one loop iteration and is always given
//! back: either consumed by a submit/release call or returned on drop.

mod decoder;
mod encoder;

pub use decoder::{Decoder, DecoderBackend, InputSlot};
pub use encoder::{Encoder, EncoderBackend, OutputSlot};

/// Outcome of a bounded wait for a buffer slot.
#[derive(Debug)]
pub enum Dequeue<T> {
    Ready(T),
    /// Nothing became available within the timeout.
    Again,
}

impl<T> Dequeue<T> {
    /// Whether a value was dequeued.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The dequeued value, if any.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(t) => Some(t),
            Self::Again => None,
        }
    }
}

/// Lifecycle of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    Released,
}

impl std::fmt::Display for CodecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
