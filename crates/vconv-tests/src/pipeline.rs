//! Conversion scenarios over scripted codecs.

use crate::mock::{audio_format, test_config, video_format, Fault, MockBackend, FRAME_US};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vconv_core::{mime, ConvertError, MediaLocator};
use vconv_media::{Demuxer, Mp4Demuxer};
use vconv_pipeline::{
    CancelToken, ConversionEvent, ConverterConfig, OutputPathResolver, VideoConverter,
};

// ── Helpers ────────────────────────────────────────────────────

fn converter(backend: MockBackend, out_dir: &Path) -> VideoConverter<MockBackend> {
    VideoConverter::with_backend(backend, test_config(), OutputPathResolver::new(out_dir))
}

fn source() -> MediaLocator {
    MediaLocator::from_path("/media/clip.mp4")
}

fn expected_output(out_dir: &Path) -> PathBuf {
    out_dir.join("converted_clip.mp4")
}

/// Run `convert` and collect progress plus the single terminal outcome.
fn convert(
    converter: &VideoConverter<MockBackend>,
    source: &MediaLocator,
) -> (Vec<f32>, Vec<Result<MediaLocator, ConvertError>>) {
    let mut progress = Vec::new();
    let outcomes = RefCell::new(Vec::new());
    converter.convert(
        source,
        mime::VIDEO_AVC,
        |fraction| progress.push(fraction),
        |output| outcomes.borrow_mut().push(Ok(output)),
        |error| outcomes.borrow_mut().push(Err(error)),
    );
    (progress, outcomes.into_inner())
}

// ── Successful conversion ──────────────────────────────────────

#[test]
fn converts_video_track_into_playable_file() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(60);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let (progress, outcomes) = convert(&converter, &source());

    assert_eq!(outcomes.len(), 1);
    let output = outcomes.into_iter().next().unwrap().unwrap();
    assert_eq!(output.path(), expected_output(dir.path()));
    assert_eq!(journal.count("muxer.add_track"), 1);
    assert_eq!(journal.count("muxer.start"), 1);
    assert_eq!(journal.count("muxer.stop"), 1);

    assert_eq!(progress.len(), 60);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    let last = *progress.last().unwrap();
    assert!(last > 0.95, "final progress {last}");

    let mut demuxer = Mp4Demuxer::open(output.path()).unwrap();
    assert_eq!(demuxer.track_count(), 1);
    assert_eq!(demuxer.sample_count(0), Some(60));
    let format = demuxer.track_format(0).unwrap();
    assert_eq!(format.mime, mime::VIDEO_AVC);
    assert_eq!(format.dimensions(), Some((16, 16)));
    demuxer.select_track(0).unwrap();
    let mut buf = Vec::new();
    let first = demuxer.read_sample(&mut buf).unwrap().unwrap();
    assert_eq!(first.presentation_time_us, 0);
    assert!(first.key_frame);
}

#[test]
fn releases_in_acquisition_order_before_completion() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(5);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let report = converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap();
    assert_eq!(report.samples_written, 5);
    assert_eq!(report.source_duration_us, Some(5 * FRAME_US));

    let order: Vec<usize> = [
        "demuxer.release",
        "decoder.release",
        "encoder.release",
        "muxer.release",
    ]
    .iter()
    .map(|e| journal.position(e).unwrap_or_else(|| panic!("{e} missing")))
    .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", journal.events());
    assert!(journal.position("muxer.stop").unwrap() < journal.position("demuxer.release").unwrap());
    for resource in ["demuxer", "decoder", "encoder", "muxer"] {
        assert_eq!(journal.count(&format!("{resource}.release")), 1, "{resource}");
    }
    assert_eq!(journal.count("decoder.stop"), 1);
    assert_eq!(journal.count("encoder.stop"), 1);
}

#[test]
fn selects_first_video_track_after_audio() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_tracks(vec![audio_format(), video_format(3), video_format(3)]);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap();
    assert_eq!(journal.count("demuxer.select 1"), 1);
    assert_eq!(journal.count("demuxer.select 2"), 0);
}

// ── Configuration failures ─────────────────────────────────────

#[test]
fn audio_only_source_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_tracks(vec![audio_format()]);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let (progress, outcomes) = convert(&converter, &source());

    assert!(progress.is_empty());
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        &outcomes[0],
        Err(ConvertError::NoMatchingTrack { prefix }) if prefix == "video/"
    ));
    assert!(!expected_output(dir.path()).exists());
    assert_eq!(journal.count("muxer.start"), 0);
    assert_eq!(journal.count("demuxer.release"), 1);
}

#[test]
fn unresolvable_display_name_opens_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let (_, outcomes) = convert(&converter, &MediaLocator::from_path("/"));

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ConvertError::DisplayNameResolution(_))));
    assert!(journal.events().is_empty());
}

#[test]
fn source_missing_required_format_fields_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut format = video_format(3);
    format.bit_rate = None;
    let backend = MockBackend::video(3).with_tracks(vec![format]);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let err = converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap_err();
    assert!(matches!(err, ConvertError::CodecConfiguration(_)));
    assert_eq!(journal.count("encoder.configure"), 0);
    assert_eq!(journal.count("demuxer.release"), 1);
}

#[test]
fn encoder_start_failure_releases_started_resources_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_fault(Fault::EncoderStart);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let (_, outcomes) = convert(&converter, &source());

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ConvertError::Codec(_))));
    assert_eq!(journal.count("decoder.start"), 1);
    assert_eq!(journal.count("decoder.stop"), 1);
    assert_eq!(journal.count("demuxer.release"), 1);
    assert_eq!(journal.count("decoder.release"), 1);
    assert_eq!(journal.count("encoder.release"), 1);
    // The encoder never started, so there is nothing to stop.
    assert_eq!(journal.count("encoder.stop"), 0);
    assert!(!expected_output(dir.path()).exists());
}

#[test]
fn decoder_configure_failure_releases_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_fault(Fault::DecoderConfigure);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let err = converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap_err();
    assert!(matches!(err, ConvertError::CodecConfiguration(_)));
    assert_eq!(journal.count("encoder.release"), 1);
    assert_eq!(journal.count("decoder.release"), 1);
    assert_eq!(journal.count("decoder.start"), 0);
}

#[test]
fn demuxer_open_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_fault(Fault::DemuxerOpen);
    let converter = converter(backend, dir.path());

    let err = converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap_err();
    assert!(matches!(err, ConvertError::Container(_)));
}

#[test]
fn non_avc_output_is_rejected_by_the_mp4_writer() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3);
    let converter = converter(backend, dir.path());

    // The scripted encoder accepts any type; the MP4 writer does not.
    let err = converter.run(&source(), mime::VIDEO_HEVC, |_| {}).unwrap_err();
    assert!(matches!(err, ConvertError::MuxerUsage(_)));
    assert!(!expected_output(dir.path()).exists());
}

// ── Runtime failures ───────────────────────────────────────────

#[test]
fn mid_stream_failure_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(20).with_fault(Fault::EncoderAfter(10));
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let mut progress = Vec::new();
    let err = converter
        .run(&source(), mime::VIDEO_AVC, |p| progress.push(p))
        .unwrap_err();

    assert!(matches!(err, ConvertError::Codec(_)));
    assert_eq!(progress.len(), 10);
    assert_eq!(journal.count("muxer.start"), 1);
    assert_eq!(journal.count("muxer.release"), 1);
    assert!(!expected_output(dir.path()).exists());
}

#[test]
fn writer_start_failure_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_fault(Fault::WriterStart);
    let converter = converter(backend, dir.path());

    let (progress, outcomes) = convert(&converter, &source());
    assert!(progress.is_empty());
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ConvertError::Io(_))));
}

#[test]
fn idle_pipeline_fails_as_stalled() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3).with_fault(Fault::DecoderIdle);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let err = converter.run(&source(), mime::VIDEO_AVC, |_| {}).unwrap_err();
    match err {
        ConvertError::Stalled(idle) => assert!(idle >= Duration::from_millis(200)),
        other => panic!("expected stall, got {other:?}"),
    }
    assert_eq!(journal.count("decoder.release"), 1);
    assert_eq!(journal.count("encoder.release"), 1);
}

#[test]
fn encoder_end_of_stream_without_samples_is_a_codec_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(0);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let (progress, outcomes) = convert(&converter, &source());

    assert!(progress.is_empty());
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ConvertError::Codec(_))));
    assert_eq!(journal.count("muxer.add_track"), 0);
    assert_eq!(journal.count("muxer.start"), 0);
    assert!(!expected_output(dir.path()).exists());
    for resource in ["demuxer", "decoder", "encoder", "muxer"] {
        assert_eq!(journal.count(&format!("{resource}.release")), 1, "{resource}");
    }
    assert_eq!(journal.count("decoder.stop"), 1);
    assert_eq!(journal.count("encoder.stop"), 1);
}

#[test]
fn payload_on_end_of_stream_buffer_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(4).with_fault(Fault::PayloadOnEndOfStream);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());

    let mut progress = Vec::new();
    let report = converter
        .run(&source(), mime::VIDEO_AVC, |p| progress.push(p))
        .unwrap();
    assert_eq!(report.samples_written, 4);
    assert_eq!(progress.len(), 4);
    assert_eq!(journal.count("muxer.stop"), 1);

    let mut demuxer = Mp4Demuxer::open(report.output.path()).unwrap();
    assert_eq!(demuxer.sample_count(0), Some(4));
    demuxer.select_track(0).unwrap();
    let mut buf = Vec::new();
    let mut timestamps = Vec::new();
    while let Some(meta) = demuxer.read_sample(&mut buf).unwrap() {
        timestamps.push(meta.presentation_time_us);
        demuxer.advance();
    }
    assert_eq!(timestamps.last(), Some(&(3 * FRAME_US)));
}

// ── Cancellation ───────────────────────────────────────────────

#[test]
fn cancel_before_start_opens_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(3);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = converter
        .run_with_cancel(&source(), mime::VIDEO_AVC, &cancel, &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, ConvertError::Cancelled));
    assert!(journal.events().is_empty());
}

#[test]
fn cancel_mid_stream_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::video(30);
    let journal = backend.journal.clone();
    let converter = converter(backend, dir.path());
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let err = converter
        .run_with_cancel(&source(), mime::VIDEO_AVC, &cancel, &mut |p| {
            if p >= 0.1 {
                trigger.cancel();
            }
        })
        .unwrap_err();

    assert!(matches!(err, ConvertError::Cancelled));
    for resource in ["demuxer", "decoder", "encoder", "muxer"] {
        assert_eq!(journal.count(&format!("{resource}.release")), 1, "{resource}");
    }
    assert!(!expected_output(dir.path()).exists());
}

// ── Spawned conversions ────────────────────────────────────────

#[test]
fn spawned_conversion_streams_events() {
    let dir = tempfile::tempdir().unwrap();
    let converter = converter(MockBackend::video(12), dir.path());

    let handle = converter.spawn(source(), mime::VIDEO_AVC);
    let events: Vec<ConversionEvent> = handle.events().iter().take_while(|e| !e.is_terminal()).collect();
    assert_eq!(events.len(), 12);

    let report = handle.join().unwrap();
    assert_eq!(report.output.path(), expected_output(dir.path()));
    assert_eq!(report.samples_written, 12);
}

#[test]
fn spawned_conversion_ends_with_exactly_one_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let converter = converter(MockBackend::video(3).with_tracks(vec![audio_format()]), dir.path());

    let handle = converter.spawn(source(), mime::VIDEO_AVC);
    let events: Vec<ConversionEvent> = handle.events().iter().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ConversionEvent::Failed(msg) if msg.contains("video/")));
    assert!(handle.join().is_err());
}

#[test]
fn native_converter_rejects_invalid_config() {
    let config = ConverterConfig {
        poll_timeout_ms: 0,
        ..ConverterConfig::default()
    };
    assert!(matches!(
        VideoConverter::new(config),
        Err(ConvertError::Config(_))
    ));
}
