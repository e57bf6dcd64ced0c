//! vconv Pipeline - decode/re-encode conversion
//!
//! This crate provides:
//! - The conversion coordinator driving demuxer, decoder, encoder and muxer
//! - The public converter API (callbacks, event stream, cancellation)
//! - Converter configuration
//! - Pipeline state tracking and progress reporting
//! - Output path resolution

pub mod backend;
pub mod cancel;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod output;
pub mod progress;
pub mod state;

pub use backend::{Backend, NativeBackend};
pub use cancel::CancelToken;
pub use config::ConverterConfig;
pub use convert::{ConversionEvent, ConversionHandle, VideoConverter};
pub use coordinator::{ConversionReport, Coordinator};
pub use output::{default_output_dir, OutputPathResolver, OUTPUT_PREFIX};
pub use progress::ProgressTracker;
pub use state::{PipelineState, StateMachine};
