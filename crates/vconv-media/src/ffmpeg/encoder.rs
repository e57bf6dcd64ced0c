//! H.264 encoder backed by an ffmpeg child process running libx264.
//!
//! Raw frames are taken from the input surface and piped into ffmpeg. The
//! Annex-B elementary stream coming back is split into access units; the
//! first parameter sets become a configuration-only output sample and the
//! negotiated output format, every coded picture becomes one AVCC sample.
//! B-frames are disabled, so output order equals input order and the
//! presentation times travel in a FIFO.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use vconv_core::{
    mime, BufferFlags, BufferInfo, ConvertError, FrameRate, MediaFormat, PixelFormat, Result,
};

use super::process::{join_pump, Fault, FfmpegProcess, StderrTail};
use super::STOP_GRACE;
use crate::codec::EncoderBackend;
use crate::nal::{write_parameter_sets_annexb, AccessUnit, AccessUnitSplitter};
use crate::surface::{Surface, SurfaceFrame, DEFAULT_SURFACE_CAPACITY};

/// Default libx264 speed preset.
pub const DEFAULT_PRESET: &str = "medium";

const READ_CHUNK: usize = 64 * 1024;

type PtsQueue = Arc<Mutex<VecDeque<i64>>>;
type SharedFormat = Arc<Mutex<Option<MediaFormat>>>;

/// One encoded output sample.
struct EncodedPacket {
    data: Vec<u8>,
    info: BufferInfo,
}

#[derive(Debug, Clone)]
struct Setup {
    format: MediaFormat,
    width: u32,
    height: u32,
    frame_rate: FrameRate,
    bit_rate: u32,
    gop: u32,
}

struct Running {
    process: FfmpegProcess,
    feeder: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// [`EncoderBackend`] running `ffmpeg -f rawvideo -i pipe:0 -c:v libx264 -f h264 pipe:1`.
pub struct FfmpegEncoder {
    binary: PathBuf,
    preset: String,
    surface_capacity: usize,
    setup: Option<Setup>,
    surface: Option<Surface>,
    running: Option<Running>,
    output_tx: Sender<EncodedPacket>,
    output_rx: Receiver<EncodedPacket>,
    slots: Vec<Option<EncodedPacket>>,
    output_format: SharedFormat,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
}

impl FfmpegEncoder {
    /// Encoder running `binary` with default settings.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let (output_tx, output_rx) = unbounded();
        Self {
            binary: binary.into(),
            preset: DEFAULT_PRESET.to_string(),
            surface_capacity: DEFAULT_SURFACE_CAPACITY,
            setup: None,
            surface: None,
            running: None,
            output_tx,
            output_rx,
            slots: Vec::new(),
            output_format: Arc::default(),
            fault: Fault::default(),
            input_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use a different libx264 preset.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    /// Frames the input surface holds before the producer blocks.
    pub fn with_surface_capacity(mut self, capacity: usize) -> Self {
        self.surface_capacity = capacity.max(1);
        self
    }

    fn ffmpeg_args(&self, setup: &Setup) -> Vec<String> {
        let rate = format!("{}/{}", setup.frame_rate.numerator, setup.frame_rate.denominator);
        let size = format!("{}x{}", setup.width, setup.height);
        let bit_rate = setup.bit_rate.to_string();
        let gop = setup.gop.to_string();
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            PixelFormat::Yuv420P.ffmpeg_name(),
            "-s",
            &size,
            "-r",
            &rate,
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            &self.preset,
            "-b:v",
            &bit_rate,
            "-g",
            &gop,
            "-bf",
            "0",
            "-x264-params",
            "aud=1",
            "-fps_mode",
            "passthrough",
            "-f",
            "h264",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn shutdown(&mut self, graceful: bool) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if graceful {
            result = join_pump(running.feeder.take(), "encoder feeder")
                .and_then(|()| running.process.finish(STOP_GRACE));
        }
        running.process.kill();
        if let Some(surface) = &self.surface {
            surface.close();
        }
        let feeder = join_pump(running.feeder.take(), "encoder feeder");
        let reader = join_pump(running.reader.take(), "encoder reader");
        result.and(feeder).and(reader)?;
        if graceful {
            self.fault.check()?;
        }
        Ok(())
    }
}

/// Frames between key frames for the requested interval, at least 1.
fn gop_length(frame_rate: FrameRate, keyframe_interval_secs: u32) -> u32 {
    let frames = (frame_rate.to_fps_f64() * keyframe_interval_secs.max(1) as f64).round();
    (frames as u32).max(1)
}

impl EncoderBackend for FfmpegEncoder {
    fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        if format.mime != mime::VIDEO_AVC {
            return Err(ConvertError::CodecConfiguration(format!(
                "No encoder for {}",
                format.mime
            )));
        }
        let missing = |field: &str| {
            ConvertError::CodecConfiguration(format!("Encoder format has no {field}"))
        };
        let (width, height) = format.dimensions().ok_or_else(|| missing("dimensions"))?;
        let frame_rate = format.frame_rate.ok_or_else(|| missing("frame rate"))?;
        let bit_rate = format.bit_rate.ok_or_else(|| missing("bit rate"))?;
        if width % 2 != 0 || height % 2 != 0 {
            return Err(ConvertError::CodecConfiguration(format!(
                "libx264 needs even dimensions, got {width}x{height}"
            )));
        }
        let gop = gop_length(frame_rate, format.keyframe_interval_secs.unwrap_or(1));
        self.setup = Some(Setup {
            format: format.clone(),
            width,
            height,
            frame_rate,
            bit_rate,
            gop,
        });
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Surface> {
        let setup = self.setup.as_ref().ok_or_else(|| {
            ConvertError::invalid_state("ffmpeg encoder", "create input surface", "Unconfigured")
        })?;
        let surface = Surface::new(setup.width, setup.height, self.surface_capacity);
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> Result<()> {
        let setup = self
            .setup
            .clone()
            .ok_or_else(|| ConvertError::invalid_state("ffmpeg encoder", "start", "Unconfigured"))?;
        let surface = self.surface.clone().ok_or_else(|| {
            ConvertError::CodecConfiguration("Encoder started without an input surface".into())
        })?;

        let args = self.ffmpeg_args(&setup);
        let mut process = FfmpegProcess::spawn(&self.binary, &args, "ffmpeg-encoder")?;
        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;
        let pts: PtsQueue = Arc::default();

        let feeder = {
            let ctx = FeederContext {
                surface,
                pts: pts.clone(),
                fault: self.fault.clone(),
                input_closed: self.input_closed.clone(),
            };
            std::thread::Builder::new()
                .name("ffmpeg-encoder-in".into())
                .spawn(move || ctx.run(stdin))?
        };
        let reader = {
            let ctx = ReaderContext {
                base_format: setup.format.clone(),
                pts,
                output: self.output_tx.clone(),
                output_format: self.output_format.clone(),
                fault: self.fault.clone(),
                input_closed: self.input_closed.clone(),
                stderr: process.stderr_tail(),
                last_pts: 0,
                samples: 0,
            };
            std::thread::Builder::new()
                .name("ffmpeg-encoder-out".into())
                .spawn(move || ctx.run(stdout))?
        };

        info!(
            width = setup.width,
            height = setup.height,
            bit_rate = setup.bit_rate,
            gop = setup.gop,
            preset = %self.preset,
            "ffmpeg encoder started"
        );
        self.running = Some(Running {
            process,
            feeder: Some(feeder),
            reader: Some(reader),
        });
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<Option<(usize, BufferInfo)>> {
        self.fault.check()?;
        let packet = match self.output_rx.recv_timeout(timeout) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            // Sender half is owned by self, never disconnected
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ConvertError::Codec("Encoder output closed".into()))
            }
        };
        let info = packet.info;
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(packet);
                index
            }
            None => {
                self.slots.push(Some(packet));
                self.slots.len() - 1
            }
        };
        Ok(Some((index, info)))
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8]> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|p| p.data.as_slice())
            .ok_or_else(|| ConvertError::Codec(format!("Output slot {index} is not dequeued")))
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.output_format.lock().clone()
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<()> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or_else(|| ConvertError::Codec(format!("Output slot {index} is not dequeued")))
    }

    fn stop(&mut self) -> Result<()> {
        let graceful = self.input_closed.load(Ordering::Acquire) && self.fault.get().is_none();
        self.shutdown(graceful)
    }

    fn release(&mut self) -> Result<()> {
        self.shutdown(false)?;
        if let Some(surface) = self.surface.take() {
            surface.close();
        }
        self.slots.clear();
        debug!("ffmpeg encoder released");
        Ok(())
    }
}

struct FeederContext {
    surface: Surface,
    pts: PtsQueue,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
}

impl FeederContext {
    fn run(self, mut stdin: ChildStdin) {
        let mut frames = 0u64;
        while let Some(message) = self.surface.acquire() {
            match message {
                SurfaceFrame::Frame(frame) => {
                    self.pts.lock().push_back(frame.pts_us);
                    if let Err(e) = stdin.write_all(&frame.data) {
                        self.fault.set(format!("Encoder input failed: {e}"));
                        return;
                    }
                    frames += 1;
                }
                SurfaceFrame::EndOfStream => {
                    self.input_closed.store(true, Ordering::Release);
                    debug!(frames, "encoder input closed");
                    // Dropping stdin lets ffmpeg flush and exit
                    return;
                }
            }
        }
    }
}

struct ReaderContext {
    base_format: MediaFormat,
    pts: PtsQueue,
    output: Sender<EncodedPacket>,
    output_format: SharedFormat,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
    stderr: StderrTail,
    last_pts: i64,
    samples: u64,
}

impl ReaderContext {
    fn run(mut self, mut stdout: ChildStdout) {
        let mut splitter = AccessUnitSplitter::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fault.set(format!("Encoder output failed: {e}"));
                    return;
                }
            };
            for unit in splitter.push(&chunk[..n]) {
                self.emit(unit);
            }
        }
        for unit in splitter.finish() {
            self.emit(unit);
        }

        if !self.input_closed.load(Ordering::Acquire) {
            self.fault.set(format!(
                "ffmpeg encoder exited early: {}",
                self.stderr.summary()
            ));
            return;
        }
        debug!(samples = self.samples, "encoder output drained");
        self.send(Vec::new(), BufferInfo::end_of_stream(self.last_pts));
    }

    fn emit(&mut self, unit: AccessUnit) {
        if self.output_format.lock().is_none() {
            let config = unit.parameter_sets();
            if config.is_complete() {
                let mut annexb = Vec::new();
                write_parameter_sets_annexb(&config, &mut annexb);
                let mut format = self.base_format.clone();
                format.color_format = None;
                format.codec_config = Some(config);
                *self.output_format.lock() = Some(format);
                debug!("encoder output format negotiated");
                let size = annexb.len();
                self.send(annexb, BufferInfo::new(0, size, 0, BufferFlags::CODEC_CONFIG));
            }
        }

        if !unit.has_vcl() {
            return;
        }
        let pts = match self.pts.lock().pop_front() {
            Some(pts) => pts,
            None => {
                warn!(last_pts = self.last_pts, "encoded picture without pending timestamp");
                self.last_pts
            }
        };
        self.last_pts = pts;
        let flags = if unit.is_idr() {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::empty()
        };
        let data = unit.to_avcc();
        let size = data.len();
        trace!(pts_us = pts, size, key = unit.is_idr(), "encoded sample");
        self.samples += 1;
        self.send(data, BufferInfo::new(0, size, pts, flags));
    }

    fn send(&self, data: Vec<u8>, info: BufferInfo) {
        if self.output.send(EncodedPacket { data, info }).is_err() {
            self.fault.set("Encoder output queue closed");
        }
    }
}
