//! The conversion loop.
//!
//! One coordinator run owns one resource set: demuxer, decoder, encoder and
//! muxer. Configuration wires the encoder's input surface into the decoder;
//! afterwards each loop iteration feeds at most one compressed sample into
//! the decoder and drains at most one encoded sample into the muxer. Every
//! exit path stops and releases the resources in acquisition order.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use vconv_core::{mime, BufferFlags, BufferInfo, ConvertError, MediaLocator, Result};
use vconv_media::{
    negotiate_output_format, select_track, CodecState, Decoder, Demuxer, Dequeue, Encoder, Muxer,
    MuxerState,
};

use crate::backend::Backend;
use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::output::OutputPathResolver;
use crate::progress::ProgressTracker;
use crate::state::{PipelineState, StateMachine};

/// Summary of a finished conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReport {
    /// The converted file.
    pub output: MediaLocator,
    pub samples_written: u64,
    /// Duration of the source video track, when the container declares one.
    pub source_duration_us: Option<i64>,
    pub elapsed: Duration,
}

/// Resources of one run, filled in as they are acquired.
struct Resources<B: Backend> {
    demuxer: Option<B::Demuxer>,
    decoder: Option<Decoder<B::Decoder>>,
    encoder: Option<Encoder<B::Encoder>>,
    muxer: Option<Muxer<B::Writer>>,
    output: Option<PathBuf>,
}

impl<B: Backend> Resources<B> {
    fn empty() -> Self {
        Self {
            demuxer: None,
            decoder: None,
            encoder: None,
            muxer: None,
            output: None,
        }
    }

    /// Stop and release everything acquired so far. Failures are logged;
    /// they never replace the outcome of the run.
    fn release_all(&mut self, failed: bool) {
        if let Some(demuxer) = self.demuxer.as_mut() {
            log_cleanup("demuxer", "release", demuxer.release());
        }
        if let Some(decoder) = self.decoder.as_mut() {
            if decoder.state() == CodecState::Started {
                log_cleanup("decoder", "stop", decoder.stop());
            }
            log_cleanup("decoder", "release", decoder.release());
        }
        if let Some(encoder) = self.encoder.as_mut() {
            if encoder.state() == CodecState::Started {
                log_cleanup("encoder", "stop", encoder.stop());
            }
            log_cleanup("encoder", "release", encoder.release());
        }

        let mut partial = false;
        if let Some(muxer) = self.muxer.as_mut() {
            if muxer.state() == MuxerState::Writing {
                log_cleanup("muxer", "stop", muxer.stop());
            }
            log_cleanup("muxer", "release", muxer.release());
            partial = failed && muxer.has_started();
        }

        if let (true, Some(path)) = (partial, self.output.as_ref()) {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed partial output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
            }
        }
    }
}

fn log_cleanup(component: &str, operation: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(component, operation, error = %e, "cleanup failed");
    }
}

/// Result of one drain step.
enum Drained {
    Nothing,
    Sample,
    EndOfStream,
}

/// Per-run loop bookkeeping.
struct LoopState<'p> {
    track: Option<usize>,
    last_input_pts_us: i64,
    progress: ProgressTracker,
    on_progress: &'p mut dyn FnMut(f32),
}

/// Drives one conversion over resources created by a [`Backend`].
pub struct Coordinator<'a, B: Backend> {
    backend: &'a B,
    config: &'a ConverterConfig,
    resolver: &'a OutputPathResolver,
    cancel: &'a CancelToken,
}

impl<'a, B: Backend> Coordinator<'a, B> {
    /// Coordinator over borrowed collaborators; nothing is opened yet.
    pub fn new(
        backend: &'a B,
        config: &'a ConverterConfig,
        resolver: &'a OutputPathResolver,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            backend,
            config,
            resolver,
            cancel,
        }
    }

    /// Convert the first video track of `source` into `output_mime`.
    ///
    /// Resources are released before this returns, on success and on
    /// failure alike.
    pub fn run(
        &self,
        source: &MediaLocator,
        output_mime: &str,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<ConversionReport> {
        let started = Instant::now();
        let mut machine = StateMachine::new();
        let mut resources = Resources::<B>::empty();

        let outcome = self.execute(source, output_mime, &mut machine, &mut resources, on_progress);
        if outcome.is_err() {
            machine.fail();
        }
        resources.release_all(outcome.is_err());

        match outcome {
            Ok((output, samples_written, source_duration_us)) => {
                let report = ConversionReport {
                    output: MediaLocator::from_path(output),
                    samples_written,
                    source_duration_us,
                    elapsed: started.elapsed(),
                };
                info!(
                    output = %report.output,
                    samples = report.samples_written,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "conversion completed"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(source = %source, error = %e, state = %machine.state(), "conversion failed");
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        source: &MediaLocator,
        output_mime: &str,
        machine: &mut StateMachine,
        resources: &mut Resources<B>,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<(PathBuf, u64, Option<i64>)> {
        machine.transition(PipelineState::Configuring)?;
        self.cancel.check()?;

        let output = self.resolver.resolve(source)?;
        resources.output = Some(output.clone());

        let demuxer = resources.demuxer.insert(self.backend.open_demuxer(source)?);
        let track = select_track(&mut *demuxer, mime::VIDEO_PREFIX)?;
        let mut output_format = negotiate_output_format(&track.format, output_mime)?;
        output_format.keyframe_interval_secs = Some(self.config.keyframe_interval_secs);

        let encoder = resources
            .encoder
            .insert(Encoder::new(self.backend.create_encoder(output_mime)?));
        encoder.configure(&output_format)?;
        let surface = encoder.create_input_surface()?;

        let decoder = resources
            .decoder
            .insert(Decoder::new(self.backend.create_decoder(&track.format)?));
        decoder.configure(&track.format, surface)?;

        decoder.start()?;
        encoder.start()?;
        let muxer = resources
            .muxer
            .insert(Muxer::new(self.backend.create_writer(&output)?));

        machine.transition(PipelineState::Running)?;
        info!(
            source = %source,
            output = %output.display(),
            track = track.index,
            input_mime = %track.format.mime,
            %output_mime,
            "conversion started"
        );

        let mut state = LoopState {
            track: None,
            last_input_pts_us: 0,
            progress: ProgressTracker::new(track.format.duration_us),
            on_progress,
        };
        let mut last_activity = Instant::now();

        loop {
            self.cancel.check()?;

            let mut active = false;
            if !decoder.input_eos() {
                active |= self.feed(demuxer, decoder, machine, &mut state)?;
            }
            match self.drain(encoder, muxer, &mut state)? {
                Drained::Nothing => {}
                Drained::Sample => active = true,
                Drained::EndOfStream => break,
            }

            if active {
                last_activity = Instant::now();
            } else {
                let idle = last_activity.elapsed();
                if idle >= self.config.stall_timeout() {
                    return Err(ConvertError::Stalled(idle));
                }
            }
        }

        if !muxer.has_started() {
            return Err(ConvertError::Codec(
                "Encoder reached end of stream without producing a sample".into(),
            ));
        }
        muxer.stop()?;
        machine.transition(PipelineState::Completed)?;
        Ok((output, muxer.samples_written(), track.format.duration_us))
    }

    /// Move one demuxed sample, or the end-of-stream marker, into the
    /// decoder. Returns whether a slot was filled.
    fn feed(
        &self,
        demuxer: &mut B::Demuxer,
        decoder: &mut Decoder<B::Decoder>,
        machine: &mut StateMachine,
        state: &mut LoopState<'_>,
    ) -> Result<bool> {
        let mut slot = match decoder.poll_input_slot(self.config.poll_timeout())? {
            Dequeue::Ready(slot) => slot,
            Dequeue::Again => return Ok(false),
        };

        let sample = demuxer.read_sample(slot.buffer()?)?;
        match sample {
            Some(sample) => {
                let flags = if sample.key_frame {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::empty()
                };
                trace!(pts_us = sample.presentation_time_us, size = sample.size, "feed sample");
                slot.submit(BufferInfo::new(0, sample.size, sample.presentation_time_us, flags))?;
                state.last_input_pts_us = sample.presentation_time_us;
                demuxer.advance();
            }
            None => {
                debug!(pts_us = state.last_input_pts_us, "input exhausted");
                slot.submit_end_of_stream(state.last_input_pts_us)?;
                machine.transition(PipelineState::Draining)?;
            }
        }
        Ok(true)
    }

    /// Move one encoded sample into the muxer, starting the muxer on the
    /// first real payload.
    fn drain(
        &self,
        encoder: &mut Encoder<B::Encoder>,
        muxer: &mut Muxer<B::Writer>,
        state: &mut LoopState<'_>,
    ) -> Result<Drained> {
        let mut slot = match encoder.poll_output_slot(self.config.poll_timeout())? {
            Dequeue::Ready(slot) => slot,
            Dequeue::Again => return Ok(Drained::Nothing),
        };

        if slot.info().is_codec_config() {
            // Parameter sets reach the container through the track format.
            trace!(size = slot.info().size, "skip codec config sample");
            slot.clear_payload();
        }

        let info = slot.info();
        if info.size > 0 {
            let track = match state.track {
                Some(track) => track,
                None => {
                    let format = slot.encoder().output_format()?;
                    let track = muxer.add_track(&format)?;
                    muxer.start()?;
                    info!(mime = %format.mime, width = ?format.width, height = ?format.height, "muxer started");
                    state.track = Some(track);
                    track
                }
            };
            muxer.write_sample(track, slot.data()?, &info)?;
            trace!(pts_us = info.presentation_time_us, size = info.size, "wrote sample");
            if let Some(fraction) = state.progress.update(info.presentation_time_us) {
                (state.on_progress)(fraction);
            }
        }

        slot.release()?;
        if info.is_end_of_stream() {
            debug!("encoder reached end of stream");
            Ok(Drained::EndOfStream)
        } else {
            Ok(Drained::Sample)
        }
    }
}
