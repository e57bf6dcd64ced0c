//! vconv Media - container and codec I/O
//!
//! This crate handles:
//! - MP4 demuxing and muxing
//! - H.264 NAL framing (AVCC, Annex-B, avcC records)
//! - Decoder and encoder lifecycles with ffmpeg-backed codecs
//! - Source track selection and encoder format negotiation
//! - Media file probing

pub mod codec;
pub mod demux;
pub mod ffmpeg;
pub mod mux;
pub mod nal;
pub mod negotiate;
pub mod probe;
pub mod surface;
pub mod track;

pub use codec::{CodecState, Decoder, DecoderBackend, Dequeue, Encoder, EncoderBackend, InputSlot, OutputSlot};
pub use demux::{Demuxer, Mp4Demuxer, SampleMeta};
pub use ffmpeg::{FfmpegDecoder, FfmpegEncoder};
pub use mux::{ContainerWriter, Mp4Writer, Muxer, MuxerState};
pub use negotiate::{negotiate_output_format, KEYFRAME_INTERVAL_SECS};
pub use probe::MediaProbe;
pub use surface::{Surface, SurfaceFrame, DEFAULT_SURFACE_CAPACITY};
pub use track::select_track;
