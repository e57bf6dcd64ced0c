//! vconv Core - Foundation types for video conversion
//!
//! This crate provides the fundamental types used throughout vconv:
//! - Track formats and media type strings
//! - Per-sample buffer metadata and flags
//! - Raw frame buffers and pixel formats
//! - Timing conversions
//! - Media locators
//! - The shared error type

pub mod buffer;
pub mod error;
pub mod format;
pub mod frame;
pub mod locator;
pub mod time;

pub use buffer::{BufferFlags, BufferInfo};
pub use error::{ConvertError, Result};
pub use format::{mime, CodecConfig, ColorFormat, MediaFormat, MediaTrack};
pub use frame::{PixelFormat, RawFrame};
pub use locator::MediaLocator;
pub use time::{micros_to_ticks, ticks_to_micros, FrameRate, MICROS_PER_SECOND};
