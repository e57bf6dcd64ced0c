//! Factory for the four native resources of a conversion.

use std::path::Path;
use vconv_core::{MediaFormat, MediaLocator, Result};
use vconv_media::ffmpeg::ffmpeg_binary;
use vconv_media::{
    ContainerWriter, DecoderBackend, Demuxer, EncoderBackend, FfmpegDecoder, FfmpegEncoder,
    Mp4Demuxer, Mp4Writer,
};

use crate::config::ConverterConfig;

/// Creates a fresh, exclusively owned resource set for each conversion.
pub trait Backend {
    type Demuxer: Demuxer;
    type Decoder: DecoderBackend;
    type Encoder: EncoderBackend;
    type Writer: ContainerWriter;

    fn open_demuxer(&self, source: &MediaLocator) -> Result<Self::Demuxer>;
    /// A decoder for the selected source track.
    fn create_decoder(&self, source: &MediaFormat) -> Result<Self::Decoder>;
    /// An encoder producing `output_mime`.
    fn create_encoder(&self, output_mime: &str) -> Result<Self::Encoder>;
    /// A container writer for `path`. Must not touch the filesystem before
    /// it is started.
    fn create_writer(&self, path: &Path) -> Result<Self::Writer>;
}

/// MP4 container I/O with ffmpeg codecs.
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    config: ConverterConfig,
}

impl NativeBackend {
    /// Backend using the ffmpeg binary and preset from `config`.
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }
}

impl Backend for NativeBackend {
    type Demuxer = Mp4Demuxer;
    type Decoder = FfmpegDecoder;
    type Encoder = FfmpegEncoder;
    type Writer = Mp4Writer;

    fn open_demuxer(&self, source: &MediaLocator) -> Result<Mp4Demuxer> {
        Mp4Demuxer::open(source.path())
    }

    fn create_decoder(&self, _source: &MediaFormat) -> Result<FfmpegDecoder> {
        Ok(FfmpegDecoder::new(
            ffmpeg_binary(self.config.ffmpeg_path.as_deref()),
            self.config.input_slots,
        ))
    }

    fn create_encoder(&self, _output_mime: &str) -> Result<FfmpegEncoder> {
        Ok(FfmpegEncoder::new(ffmpeg_binary(self.config.ffmpeg_path.as_deref()))
            .with_preset(&self.config.encoder_preset)
            .with_surface_capacity(self.config.surface_capacity))
    }

    fn create_writer(&self, path: &Path) -> Result<Mp4Writer> {
        Ok(Mp4Writer::new(path))
    }
}
