//! End-to-end conversion through the ffmpeg codecs.

use std::path::Path;
use std::process::Command;
use vconv_core::{mime, MediaLocator};
use vconv_media::ffmpeg::{ffmpeg_binary, is_available};
use vconv_media::{Demuxer, Mp4Demuxer};
use vconv_pipeline::{ConversionEvent, ConverterConfig, VideoConverter};

/// One second of 64x64 test pattern at 30 fps, H.264 in MP4.
fn make_source(path: &Path) {
    let status = Command::new(ffmpeg_binary(None))
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .args(["-f", "lavfi", "-i", "testsrc=size=64x64:rate=30", "-t", "1"])
        .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
        .arg(path)
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
#[ignore = "requires ffmpeg with libx264"]
fn converts_generated_clip_with_ffmpeg() {
    if !is_available(None) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("pattern.mp4");
    make_source(&source);

    let config = ConverterConfig {
        output_dir: Some(dir.path().join("out")),
        encoder_preset: "ultrafast".into(),
        ..ConverterConfig::default()
    };
    let converter = VideoConverter::new(config).unwrap();
    let handle = converter.spawn(MediaLocator::from_path(&source), mime::VIDEO_AVC);

    let mut progress = Vec::new();
    let mut completed = None;
    for event in handle.events().iter() {
        match event {
            ConversionEvent::Progress(p) => progress.push(p),
            ConversionEvent::Completed(output) => completed = Some(output),
            ConversionEvent::Failed(message) => panic!("conversion failed: {message}"),
        }
    }
    let report = handle.join().unwrap();
    let output = completed.unwrap();
    assert_eq!(output, report.output);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let mut demuxer = Mp4Demuxer::open(output.path()).unwrap();
    let format = demuxer.track_format(0).unwrap();
    assert_eq!(format.mime, mime::VIDEO_AVC);
    assert_eq!(format.dimensions(), Some((64, 64)));
    assert_eq!(demuxer.sample_count(0), Some(30));

    demuxer.select_track(0).unwrap();
    let mut buf = Vec::new();
    let first = demuxer.read_sample(&mut buf).unwrap().unwrap();
    assert!(first.key_frame);
}
