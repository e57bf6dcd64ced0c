//! MP4 container round trips across the writer, the demuxer and the
//! coordinator.

use crate::mock::{samples, video_format, FileBackend, FRAME_US};
use proptest::prelude::*;
use std::path::Path;
use vconv_core::{mime, BufferFlags, BufferInfo, FrameRate, MediaLocator};
use vconv_media::{Demuxer, MediaProbe, Mp4Demuxer, Mp4Writer, Muxer};
use vconv_pipeline::{OutputPathResolver, VideoConverter};

use crate::mock::test_config;

/// Write `timestamps` as a single-track MP4, key frame every `gop` samples.
fn write_mp4(path: &Path, timestamps: &[i64], gop: usize) {
    let mut muxer = Muxer::new(Mp4Writer::new(path));
    let track = muxer.add_track(&video_format(timestamps.len())).unwrap();
    muxer.start().unwrap();
    for (i, &pts) in timestamps.iter().enumerate() {
        let sample = &samples(i + 1)[i];
        let flags = if i % gop == 0 {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::empty()
        };
        let info = BufferInfo::new(0, sample.data.len(), pts, flags);
        muxer.write_sample(track, &sample.data, &info).unwrap();
    }
    muxer.stop().unwrap();
    muxer.release().unwrap();
}

fn read_all(path: &Path) -> Vec<(i64, bool, Vec<u8>)> {
    let mut demuxer = Mp4Demuxer::open(path).unwrap();
    demuxer.select_track(0).unwrap();
    let mut out = Vec::new();
    let mut buf = Vec::new();
    while let Some(meta) = demuxer.read_sample(&mut buf).unwrap() {
        out.push((meta.presentation_time_us, meta.key_frame, buf[..meta.size].to_vec()));
        demuxer.advance();
    }
    demuxer.release().unwrap();
    out
}

#[test]
fn written_file_recovers_track_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    let timestamps: Vec<i64> = (0..30).map(|i| i * FRAME_US).collect();
    write_mp4(&path, &timestamps, 10);

    let demuxer = Mp4Demuxer::open(&path).unwrap();
    let format = demuxer.track_format(0).unwrap();
    assert_eq!(format.mime, mime::VIDEO_AVC);
    assert_eq!(format.dimensions(), Some((16, 16)));
    assert_eq!(format.codec_config, video_format(1).codec_config);
    assert_eq!(format.duration_us, Some(30 * FRAME_US));
    assert_eq!(format.frame_rate.map(FrameRate::rounded_fps), Some(30));
    assert!(format.bit_rate.is_some_and(|b| b > 0));
}

#[test]
fn written_samples_read_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    let timestamps: Vec<i64> = (0..12).map(|i| i * FRAME_US).collect();
    write_mp4(&path, &timestamps, 4);

    let read = read_all(&path);
    assert_eq!(read.len(), 12);
    for (i, (pts, key, data)) in read.iter().enumerate() {
        assert_eq!(*pts, timestamps[i]);
        assert_eq!(*key, i % 4 == 0);
        assert_eq!(data, &samples(i + 1)[i].data);
    }
}

#[test]
fn offset_timeline_keeps_its_first_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.mp4");
    let timestamps: Vec<i64> = (0..5).map(|i| 2_000_000 + i * FRAME_US).collect();
    write_mp4(&path, &timestamps, 5);

    let read: Vec<i64> = read_all(&path).into_iter().map(|(pts, _, _)| pts).collect();
    assert_eq!(read, timestamps);
}

#[test]
fn probe_describes_written_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    let timestamps: Vec<i64> = (0..10).map(|i| i * FRAME_US).collect();
    write_mp4(&path, &timestamps, 5);

    let probe = MediaProbe::probe(&path).unwrap();
    assert!(probe.has_video());
    assert!(!probe.has_audio());
    let json = probe.to_json().unwrap();
    assert!(json.contains("video/avc"), "{json}");
}

#[test]
fn converts_real_container_through_scripted_codecs() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("holiday.mp4");
    let timestamps: Vec<i64> = (0..15).map(|i| i * FRAME_US).collect();
    write_mp4(&source_path, &timestamps, 15);

    let out_dir = dir.path().join("out");
    let converter = VideoConverter::with_backend(
        FileBackend::default(),
        test_config(),
        OutputPathResolver::new(&out_dir),
    );
    let mut progress = Vec::new();
    let report = converter
        .run(
            &MediaLocator::from_path(&source_path),
            mime::VIDEO_AVC,
            |p| progress.push(p),
        )
        .unwrap();

    assert_eq!(report.output.path(), out_dir.join("converted_holiday.mp4"));
    assert_eq!(report.samples_written, 15);
    assert_eq!(progress.len(), 15);

    let converted: Vec<i64> = read_all(report.output.path())
        .into_iter()
        .map(|(pts, _, _)| pts)
        .collect();
    assert_eq!(converted, timestamps);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_increasing_timestamps_survive_a_round_trip(
        deltas in proptest::collection::vec(1i64..100_000, 1..40),
        start in 0i64..5_000_000,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.mp4");
        let timestamps: Vec<i64> = deltas
            .iter()
            .scan(start, |pts, d| {
                let current = *pts;
                *pts += d;
                Some(current)
            })
            .collect();
        write_mp4(&path, &timestamps, 7);

        let read: Vec<i64> = read_all(&path).into_iter().map(|(pts, _, _)| pts).collect();
        prop_assert_eq!(read, timestamps);
    }
}
