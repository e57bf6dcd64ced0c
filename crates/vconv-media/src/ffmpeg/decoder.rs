//! H.264 decoder backed by an ffmpeg child process.
//!
//! Input samples are converted from AVCC to Annex-B and piped into ffmpeg;
//! decoded `yuv420p` frames are read back and rendered onto the surface.
//! ffmpeg emits frames in presentation order, so the presentation times of
//! queued samples are kept in a min-heap and popped once per frame.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use vconv_core::{
    mime, BufferInfo, CodecConfig, ConvertError, MediaFormat, PixelFormat, RawFrame, Result,
};

use super::process::{join_pump, read_full, Fault, FfmpegProcess, StderrTail};
use super::STOP_GRACE;
use crate::codec::DecoderBackend;
use crate::nal::{avcc_to_annexb, write_parameter_sets_annexb};
use crate::surface::Surface;

/// Default number of input slots.
pub const DEFAULT_INPUT_SLOTS: usize = 4;

type PtsHeap = Arc<Mutex<BinaryHeap<Reverse<i64>>>>;

/// A submitted input slot on its way to ffmpeg.
struct Packet {
    index: usize,
    buffer: Vec<u8>,
    info: BufferInfo,
}

struct Setup {
    width: u32,
    height: u32,
    config: CodecConfig,
    surface: Surface,
}

struct Running {
    process: FfmpegProcess,
    packets: Option<Sender<Packet>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// [`DecoderBackend`] running `ffmpeg -f h264 -i pipe:0 -f rawvideo pipe:1`.
pub struct FfmpegDecoder {
    binary: PathBuf,
    setup: Option<Setup>,
    running: Option<Running>,
    slots: Vec<Option<Vec<u8>>>,
    free_tx: Sender<(usize, Vec<u8>)>,
    free_rx: Receiver<(usize, Vec<u8>)>,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
}

impl FfmpegDecoder {
    /// Decoder running `binary` with `input_slots` input buffers.
    pub fn new(binary: impl Into<PathBuf>, input_slots: usize) -> Self {
        let (free_tx, free_rx) = unbounded();
        let count = input_slots.max(1);
        for index in 0..count {
            // Receiver is alive, send cannot fail
            let _ = free_tx.send((index, Vec::new()));
        }
        Self {
            binary: binary.into(),
            setup: None,
            running: None,
            slots: (0..count).map(|_| None).collect(),
            free_tx,
            free_rx,
            fault: Fault::default(),
            input_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ffmpeg_args(width: u32, height: u32) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-f",
            "rawvideo",
            "-pix_fmt",
            PixelFormat::Yuv420P.ffmpeg_name(),
            "-s",
            &format!("{width}x{height}"),
            "-fps_mode",
            "passthrough",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Option<Vec<u8>>> {
        self.slots
            .get_mut(index)
            .ok_or_else(|| ConvertError::Codec(format!("No input slot {index}")))
    }

    fn shutdown(&mut self, graceful: bool) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        // Ends the writer loop, which closes ffmpeg's stdin
        running.packets = None;
        let mut result = Ok(());
        if graceful {
            result = join_pump(running.writer.take(), "decoder writer")
                .and_then(|()| running.process.finish(STOP_GRACE));
        }
        running.process.kill();
        if let Some(setup) = &self.setup {
            setup.surface.close();
        }
        let writer = join_pump(running.writer.take(), "decoder writer");
        let reader = join_pump(running.reader.take(), "decoder reader");
        result.and(writer).and(reader)?;
        if graceful {
            self.fault.check()?;
        }
        Ok(())
    }
}

impl DecoderBackend for FfmpegDecoder {
    fn configure(&mut self, format: &MediaFormat, surface: Surface) -> Result<()> {
        if format.mime != mime::VIDEO_AVC {
            return Err(ConvertError::CodecConfiguration(format!(
                "No decoder for {}",
                format.mime
            )));
        }
        let (width, height) = format.dimensions().ok_or_else(|| {
            ConvertError::CodecConfiguration("Source format has no dimensions".into())
        })?;
        let config = format
            .codec_config
            .clone()
            .filter(CodecConfig::is_complete)
            .ok_or_else(|| {
                ConvertError::CodecConfiguration("Source format has no parameter sets".into())
            })?;
        if surface.dimensions() != (width, height) {
            return Err(ConvertError::CodecConfiguration(format!(
                "Surface {:?} does not match source {width}x{height}",
                surface.dimensions()
            )));
        }
        self.setup = Some(Setup {
            width,
            height,
            config,
            surface,
        });
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| ConvertError::invalid_state("ffmpeg decoder", "start", "Unconfigured"))?;

        let args = Self::ffmpeg_args(setup.width, setup.height);
        let mut process = FfmpegProcess::spawn(&self.binary, &args, "ffmpeg-decoder")?;
        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;
        let heap: PtsHeap = Arc::default();
        let (packets_tx, packets_rx) = unbounded();

        let writer = {
            let ctx = WriterContext {
                config: setup.config.clone(),
                heap: heap.clone(),
                free: self.free_tx.clone(),
                fault: self.fault.clone(),
                input_closed: self.input_closed.clone(),
            };
            std::thread::Builder::new()
                .name("ffmpeg-decoder-in".into())
                .spawn(move || ctx.run(stdin, packets_rx))?
        };
        let reader = {
            let ctx = ReaderContext {
                width: setup.width,
                height: setup.height,
                surface: setup.surface.clone(),
                heap,
                fault: self.fault.clone(),
                input_closed: self.input_closed.clone(),
                stderr: process.stderr_tail(),
            };
            std::thread::Builder::new()
                .name("ffmpeg-decoder-out".into())
                .spawn(move || ctx.run(stdout))?
        };

        info!(width = setup.width, height = setup.height, "ffmpeg decoder started");
        self.running = Some(Running {
            process,
            packets: Some(packets_tx),
            writer: Some(writer),
            reader: Some(reader),
        });
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>> {
        self.fault.check()?;
        match self.free_rx.recv_timeout(timeout) {
            Ok((index, mut buffer)) => {
                buffer.clear();
                *self.slot_mut(index)? = Some(buffer);
                Ok(Some(index))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ConvertError::Codec("Decoder slot pool closed".into()))
            }
        }
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut Vec<u8>> {
        self.slot_mut(index)?
            .as_mut()
            .ok_or_else(|| ConvertError::Codec(format!("Input slot {index} is not dequeued")))
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<()> {
        let packets = self
            .running
            .as_ref()
            .and_then(|r| r.packets.clone())
            .ok_or_else(|| ConvertError::invalid_state("ffmpeg decoder", "queue input", "NotRunning"))?;
        let buffer = self
            .slot_mut(index)?
            .take()
            .ok_or_else(|| ConvertError::Codec(format!("Input slot {index} is not dequeued")))?;
        packets
            .send(Packet {
                index,
                buffer,
                info,
            })
            .map_err(|_| ConvertError::Codec("Decoder input pump stopped".into()))?;
        self.fault.check()
    }

    fn cancel_input_buffer(&mut self, index: usize) {
        if let Some(buffer) = self.slots.get_mut(index).and_then(Option::take) {
            let _ = self.free_tx.send((index, buffer));
        }
    }

    fn stop(&mut self) -> Result<()> {
        let graceful = self.input_closed.load(Ordering::Acquire) && self.fault.get().is_none();
        self.shutdown(graceful)
    }

    fn release(&mut self) -> Result<()> {
        self.shutdown(false)?;
        if let Some(setup) = self.setup.take() {
            setup.surface.close();
        }
        debug!("ffmpeg decoder released");
        Ok(())
    }
}

struct WriterContext {
    config: CodecConfig,
    heap: PtsHeap,
    free: Sender<(usize, Vec<u8>)>,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
}

impl WriterContext {
    fn run(self, mut stdin: ChildStdin, packets: Receiver<Packet>) {
        let mut annexb = Vec::new();
        for Packet { index, buffer, info } in packets.iter() {
            let result = self.write_packet(&mut stdin, &buffer, &info, &mut annexb);
            let _ = self.free.send((index, buffer));
            if let Err(e) = result {
                self.fault.set(format!("Decoder input failed: {e}"));
                return;
            }
            if info.is_end_of_stream() {
                self.input_closed.store(true, Ordering::Release);
                debug!("decoder input closed");
                return;
            }
        }
    }

    fn write_packet(
        &self,
        stdin: &mut ChildStdin,
        buffer: &[u8],
        info: &BufferInfo,
        annexb: &mut Vec<u8>,
    ) -> Result<()> {
        if info.size == 0 {
            return Ok(());
        }
        let payload = buffer.get(info.range()).ok_or_else(|| {
            ConvertError::Codec(format!(
                "Input range {:?} exceeds slot of {} bytes",
                info.range(),
                buffer.len()
            ))
        })?;

        annexb.clear();
        if info.is_key_frame() {
            write_parameter_sets_annexb(&self.config, annexb);
        }
        avcc_to_annexb(payload, self.config.nal_length_size, annexb)?;
        if info.is_codec_config() {
            trace!(bytes = annexb.len(), "decoder config input");
        } else {
            self.heap.lock().push(Reverse(info.presentation_time_us));
        }
        stdin.write_all(annexb)?;
        Ok(())
    }
}

struct ReaderContext {
    width: u32,
    height: u32,
    surface: Surface,
    heap: PtsHeap,
    fault: Fault,
    input_closed: Arc<AtomicBool>,
    stderr: StderrTail,
}

impl ReaderContext {
    fn run(self, mut stdout: ChildStdout) {
        let frame_size = PixelFormat::Yuv420P.frame_size(self.width, self.height);
        let mut last_pts = 0i64;
        let mut frames = 0u64;
        loop {
            let mut data = vec![0u8; frame_size];
            match read_full(&mut stdout, &mut data) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.fault.set(format!("Decoder output failed: {e}"));
                    return;
                }
            }
            let pts = match self.heap.lock().pop() {
                Some(Reverse(pts)) => pts,
                None => {
                    warn!(last_pts, "decoded frame without pending timestamp");
                    last_pts
                }
            };
            last_pts = pts;
            let Some(frame) = RawFrame::new(PixelFormat::Yuv420P, self.width, self.height, pts, data)
            else {
                self.fault.set("Decoded frame has unexpected size");
                return;
            };
            if let Err(e) = self.surface.render(frame) {
                if !self.surface.is_closed() {
                    self.fault.set(format!("Rendering decoded frame failed: {e}"));
                }
                return;
            }
            frames += 1;
        }

        if !self.input_closed.load(Ordering::Acquire) {
            self.fault.set(format!(
                "ffmpeg decoder exited early: {}",
                self.stderr.summary()
            ));
            return;
        }
        debug!(frames, "decoder output drained");
        if let Err(e) = self.surface.signal_end_of_stream() {
            if !self.surface.is_closed() {
                self.fault.set(format!("Signalling end of stream failed: {e}"));
            }
        }
    }
}
