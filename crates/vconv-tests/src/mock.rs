//! Scripted resources for driving the coordinator without ffmpeg.
//!
//! Every resource records its lifecycle calls in a shared [`Journal`] so
//! tests can assert ordering and release counts. Codecs pass frames through
//! a real [`Surface`]; the container writer wraps the real [`Mp4Writer`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vconv_core::{
    mime, BufferFlags, BufferInfo, CodecConfig, ConvertError, FrameRate, MediaFormat,
    MediaLocator, PixelFormat, RawFrame, Result,
};
use vconv_media::nal::write_parameter_sets_annexb;
use vconv_media::{
    ContainerWriter, DecoderBackend, Demuxer, EncoderBackend, Mp4Demuxer, Mp4Writer, SampleMeta,
    Surface, SurfaceFrame,
};
use vconv_pipeline::{Backend, ConverterConfig};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 16;
pub const FRAME_US: i64 = 33_333;

/// Ordered record of lifecycle calls, shared by all resources of a backend.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    /// Append an event.
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Occurrences of `event`.
    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }
}

/// Failure injected into one of the scripted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    DemuxerOpen,
    DecoderConfigure,
    EncoderStart,
    /// The encoder fails when asked for the n-th encoded frame.
    EncoderAfter(usize),
    /// The decoder never hands out input slots.
    DecoderIdle,
    /// The writer refuses to start.
    WriterStart,
    /// The encoder holds back its last frame and delivers it on the
    /// end-of-stream buffer.
    PayloadOnEndOfStream,
}

/// SPS and PPS for a 16x16 baseline stream.
pub fn parameter_sets() -> CodecConfig {
    CodecConfig {
        sps: vec![vec![0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80]],
        pps: vec![vec![0x68, 0xCE, 0x3C, 0x80]],
        nal_length_size: 4,
    }
}

/// A 16x16 H.264 track at 30 fps lasting `frames` frames.
pub fn video_format(frames: usize) -> MediaFormat {
    MediaFormat {
        bit_rate: Some(400_000),
        frame_rate: Some(FrameRate::FPS_30),
        duration_us: Some(frames as i64 * FRAME_US),
        codec_config: Some(parameter_sets()),
        ..MediaFormat::video(mime::VIDEO_AVC, WIDTH, HEIGHT)
    }
}

/// An AAC track.
pub fn audio_format() -> MediaFormat {
    MediaFormat {
        sample_rate: Some(48_000),
        channel_count: Some(2),
        duration_us: Some(1_000_000),
        ..MediaFormat::new(mime::AUDIO_AAC)
    }
}

/// One AVCC sample holding a single slice NAL unit.
pub fn slice_payload(index: usize, key_frame: bool) -> Vec<u8> {
    let nal_type = if key_frame { 0x65 } else { 0x41 };
    let body = [nal_type, 0x88, 0x84, index as u8, (index >> 8) as u8];
    let mut out = (body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&body);
    out
}

#[derive(Debug, Clone)]
pub struct ScriptedSample {
    pub pts_us: i64,
    pub key_frame: bool,
    pub data: Vec<u8>,
}

/// `frames` samples at 30 fps with a key frame every 30 frames.
pub fn samples(frames: usize) -> Vec<ScriptedSample> {
    (0..frames)
        .map(|i| ScriptedSample {
            pts_us: i as i64 * FRAME_US,
            key_frame: i % 30 == 0,
            data: slice_payload(i, i % 30 == 0),
        })
        .collect()
}

/// Backend over in-memory tracks, scripted codecs and the MP4 writer.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub tracks: Vec<MediaFormat>,
    pub samples: Vec<ScriptedSample>,
    pub fault: Fault,
    pub journal: Journal,
    pub surface_capacity: usize,
}

impl MockBackend {
    /// One video track of `frames` frames.
    pub fn video(frames: usize) -> Self {
        Self {
            tracks: vec![video_format(frames)],
            samples: samples(frames),
            fault: Fault::None,
            journal: Journal::default(),
            surface_capacity: 4,
        }
    }

    /// Replace the container's tracks.
    pub fn with_tracks(mut self, tracks: Vec<MediaFormat>) -> Self {
        self.tracks = tracks;
        self
    }

    /// Inject `fault`.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }
}

impl Backend for MockBackend {
    type Demuxer = MockDemuxer;
    type Decoder = MockDecoder;
    type Encoder = MockEncoder;
    type Writer = JournaledWriter;

    fn open_demuxer(&self, source: &MediaLocator) -> Result<MockDemuxer> {
        if self.fault == Fault::DemuxerOpen {
            return Err(ConvertError::Container(format!("Cannot open {source}")));
        }
        self.journal.record("demuxer.open");
        Ok(MockDemuxer {
            tracks: self.tracks.clone(),
            samples: self.samples.clone().into(),
            selected: None,
            journal: self.journal.clone(),
        })
    }

    fn create_decoder(&self, _source: &MediaFormat) -> Result<MockDecoder> {
        Ok(MockDecoder::new(self.journal.clone(), self.fault))
    }

    fn create_encoder(&self, _output_mime: &str) -> Result<MockEncoder> {
        Ok(MockEncoder::new(
            self.journal.clone(),
            self.fault,
            self.surface_capacity,
        ))
    }

    fn create_writer(&self, path: &Path) -> Result<JournaledWriter> {
        Ok(JournaledWriter {
            inner: Mp4Writer::new(path),
            journal: self.journal.clone(),
            fail_start: self.fault == Fault::WriterStart,
        })
    }
}

/// Backend reading a real MP4 file through [`Mp4Demuxer`] with scripted
/// codecs.
#[derive(Debug, Clone, Default)]
pub struct FileBackend {
    pub journal: Journal,
}

impl Backend for FileBackend {
    type Demuxer = Mp4Demuxer;
    type Decoder = MockDecoder;
    type Encoder = MockEncoder;
    type Writer = JournaledWriter;

    fn open_demuxer(&self, source: &MediaLocator) -> Result<Mp4Demuxer> {
        Mp4Demuxer::open(source.path())
    }

    fn create_decoder(&self, _source: &MediaFormat) -> Result<MockDecoder> {
        Ok(MockDecoder::new(self.journal.clone(), Fault::None))
    }

    fn create_encoder(&self, _output_mime: &str) -> Result<MockEncoder> {
        Ok(MockEncoder::new(self.journal.clone(), Fault::None, 4))
    }

    fn create_writer(&self, path: &Path) -> Result<JournaledWriter> {
        Ok(JournaledWriter {
            inner: Mp4Writer::new(path),
            journal: self.journal.clone(),
            fail_start: false,
        })
    }
}

pub struct MockDemuxer {
    tracks: Vec<MediaFormat>,
    samples: VecDeque<ScriptedSample>,
    selected: Option<usize>,
    journal: Journal,
}

impl Demuxer for MockDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<MediaFormat> {
        self.tracks
            .get(index)
            .cloned()
            .ok_or_else(|| ConvertError::Container(format!("No track {index}")))
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        self.journal.record(format!("demuxer.select {index}"));
        self.selected = Some(index);
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>> {
        if self.selected.is_none() {
            return Err(ConvertError::invalid_state("demuxer", "read sample", "NoTrackSelected"));
        }
        let Some(sample) = self.samples.front() else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(&sample.data);
        Ok(Some(SampleMeta {
            size: sample.data.len(),
            presentation_time_us: sample.pts_us,
            key_frame: sample.key_frame,
        }))
    }

    fn advance(&mut self) -> bool {
        self.samples.pop_front();
        !self.samples.is_empty()
    }

    fn release(&mut self) -> Result<()> {
        self.journal.record("demuxer.release");
        Ok(())
    }
}

/// Renders one black frame per queued sample onto the surface.
pub struct MockDecoder {
    journal: Journal,
    fault: Fault,
    surface: Option<Surface>,
    slots: Vec<Vec<u8>>,
    free: VecDeque<usize>,
}

impl MockDecoder {
    fn new(journal: Journal, fault: Fault) -> Self {
        Self {
            journal,
            fault,
            surface: None,
            slots: vec![Vec::new(); 2],
            free: (0..2).collect(),
        }
    }

    fn surface(&self) -> Result<&Surface> {
        self.surface
            .as_ref()
            .ok_or_else(|| ConvertError::invalid_state("mock decoder", "queue input", "Unconfigured"))
    }
}

impl DecoderBackend for MockDecoder {
    fn configure(&mut self, format: &MediaFormat, surface: Surface) -> Result<()> {
        if self.fault == Fault::DecoderConfigure {
            return Err(ConvertError::CodecConfiguration(format!(
                "Injected failure configuring {}",
                format.mime
            )));
        }
        self.journal.record("decoder.configure");
        self.surface = Some(surface);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.journal.record("decoder.start");
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>> {
        if self.fault == Fault::DecoderIdle {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        Ok(self.free.pop_front())
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut Vec<u8>> {
        self.slots
            .get_mut(index)
            .ok_or_else(|| ConvertError::Codec(format!("No input slot {index}")))
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<()> {
        let surface = self.surface()?;
        if info.is_end_of_stream() {
            surface.signal_end_of_stream()?;
        } else {
            surface.render(RawFrame::black(
                PixelFormat::Yuv420P,
                WIDTH,
                HEIGHT,
                info.presentation_time_us,
            ))?;
        }
        self.free.push_back(index);
        Ok(())
    }

    fn cancel_input_buffer(&mut self, index: usize) {
        self.free.push_back(index);
    }

    fn stop(&mut self) -> Result<()> {
        self.journal.record("decoder.stop");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.journal.record("decoder.release");
        Ok(())
    }
}

/// Emits the parameter sets once, then one slice per surface frame.
pub struct MockEncoder {
    journal: Journal,
    fault: Fault,
    capacity: usize,
    format: Option<MediaFormat>,
    surface: Option<Surface>,
    output_format: Option<MediaFormat>,
    outputs: Vec<Vec<u8>>,
    encoded: usize,
    held: Option<(Vec<u8>, i64, BufferFlags)>,
}

impl MockEncoder {
    fn new(journal: Journal, fault: Fault, capacity: usize) -> Self {
        Self {
            journal,
            fault,
            capacity,
            format: None,
            surface: None,
            output_format: None,
            outputs: Vec::new(),
            encoded: 0,
            held: None,
        }
    }

    fn emit(&mut self, data: Vec<u8>, pts_us: i64, flags: BufferFlags) -> (usize, BufferInfo) {
        let info = BufferInfo::new(0, data.len(), pts_us, flags);
        self.outputs.push(data);
        (self.outputs.len() - 1, info)
    }
}

impl EncoderBackend for MockEncoder {
    fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        self.journal.record("encoder.configure");
        self.format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Surface> {
        let surface = Surface::new(WIDTH, HEIGHT, self.capacity);
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> Result<()> {
        if self.fault == Fault::EncoderStart {
            return Err(ConvertError::Codec("Injected encoder start failure".into()));
        }
        self.journal.record("encoder.start");
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<Option<(usize, BufferInfo)>> {
        let Some(format) = self.format.clone() else {
            return Err(ConvertError::invalid_state("mock encoder", "dequeue output", "Unconfigured"));
        };
        if self.output_format.is_none() {
            let config = parameter_sets();
            let mut annexb = Vec::new();
            write_parameter_sets_annexb(&config, &mut annexb);
            self.output_format = Some(MediaFormat {
                codec_config: Some(config),
                color_format: None,
                ..format
            });
            return Ok(Some(self.emit(annexb, 0, BufferFlags::CODEC_CONFIG)));
        }

        let Some(surface) = self.surface.as_ref() else {
            return Ok(None);
        };
        if surface.pending() == 0 {
            return Ok(None);
        }
        match surface.acquire() {
            Some(SurfaceFrame::Frame(frame)) => {
                if self.fault == Fault::EncoderAfter(self.encoded) {
                    return Err(ConvertError::Codec("Injected encoder failure".into()));
                }
                let key_frame = self.encoded % 30 == 0;
                let data = slice_payload(self.encoded, key_frame);
                self.encoded += 1;
                let flags = if key_frame {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::empty()
                };
                if self.fault != Fault::PayloadOnEndOfStream {
                    return Ok(Some(self.emit(data, frame.pts_us, flags)));
                }
                match self.held.replace((data, frame.pts_us, flags)) {
                    Some((data, pts_us, flags)) => Ok(Some(self.emit(data, pts_us, flags))),
                    None => Ok(None),
                }
            }
            Some(SurfaceFrame::EndOfStream) => match self.held.take() {
                Some((data, pts_us, flags)) => {
                    Ok(Some(self.emit(data, pts_us, flags | BufferFlags::END_OF_STREAM)))
                }
                None => Ok(Some(self.emit(Vec::new(), 0, BufferFlags::END_OF_STREAM))),
            },
            None => Ok(None),
        }
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8]> {
        self.outputs
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| ConvertError::Codec(format!("No output slot {index}")))
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.output_format.clone()
    }

    fn release_output_buffer(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.journal.record("encoder.stop");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(surface) = &self.surface {
            surface.close();
        }
        self.journal.record("encoder.release");
        Ok(())
    }
}

/// [`Mp4Writer`] that journals its lifecycle.
pub struct JournaledWriter {
    inner: Mp4Writer,
    journal: Journal,
    fail_start: bool,
}

impl ContainerWriter for JournaledWriter {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        self.journal.record("muxer.add_track");
        self.inner.add_track(format)
    }

    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(ConvertError::Io(std::io::Error::other("Injected writer failure")));
        }
        self.journal.record("muxer.start");
        self.inner.start()
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()> {
        self.inner.write_sample(track, data, info)
    }

    fn stop(&mut self) -> Result<()> {
        self.journal.record("muxer.stop");
        self.inner.stop()
    }

    fn release(&mut self) -> Result<()> {
        self.journal.record("muxer.release");
        self.inner.release()
    }
}

/// Fast polling settings for scripted runs.
pub fn test_config() -> ConverterConfig {
    ConverterConfig {
        poll_timeout_ms: 1,
        stall_timeout_ms: 200,
        ..ConverterConfig::default()
    }
}
