//! Progressive MP4 file writer.
//!
//! Writes ftyp and a 64-bit mdat header at start, appends sample data as it
//! arrives, and on stop patches the mdat size and appends the moov box.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use vconv_core::{mime, BufferInfo, CodecConfig, ConvertError, MediaFormat, Result};

use super::atoms::{fill_large_box_size, large_box_size_placeholder, MEDIA_TIMESCALE};
use super::mp4::{write_ftyp, write_moov, SampleInfo, VideoTrackInfo};
use super::ContainerWriter;
use crate::nal::write_avcc_record;

/// Duration of the last sample when nothing better is known (30 fps).
const FALLBACK_FRAME_DURATION_US: i64 = 33_333;

#[derive(Debug, Clone)]
struct PendingSample {
    offset: u64,
    size: u32,
    pts_us: i64,
    is_sync: bool,
}

#[derive(Debug)]
struct TrackSetup {
    width: u32,
    height: u32,
    avcc: Vec<u8>,
    frame_duration_us: Option<i64>,
}

/// [`ContainerWriter`] producing a single-track H.264 MP4 file.
pub struct Mp4Writer {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    track: Option<TrackSetup>,
    mdat_size_pos: u64,
    position: u64,
    samples: Vec<PendingSample>,
}

impl Mp4Writer {
    /// A writer for `path`. Nothing touches the filesystem before
    /// [`ContainerWriter::start`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            track: None,
            mdat_size_pos: 0,
            position: 0,
            samples: Vec::new(),
        }
    }

    /// Get the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples written so far.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn build_track_info(&self, track: &TrackSetup) -> Result<VideoTrackInfo> {
        let first_pts = self.samples.first().map_or(0, |s| s.pts_us);
        let composition_offset = i32::try_from(first_pts).map_err(|_| {
            ConvertError::MuxerUsage(format!(
                "First timestamp {first_pts} us does not fit a composition offset"
            ))
        })?;

        let mut samples = Vec::with_capacity(self.samples.len());
        let mut previous_duration = None;
        for (i, sample) in self.samples.iter().enumerate() {
            let duration_us = match self.samples.get(i + 1) {
                Some(next) => next.pts_us - sample.pts_us,
                None => previous_duration
                    .or(track.frame_duration_us)
                    .unwrap_or(FALLBACK_FRAME_DURATION_US),
            };
            previous_duration = Some(duration_us);
            let duration = u32::try_from(duration_us).map_err(|_| {
                ConvertError::MuxerUsage(format!(
                    "Sample {i} duration {duration_us} us is out of range"
                ))
            })?;
            samples.push(SampleInfo {
                offset: sample.offset,
                size: sample.size,
                duration,
                is_sync: sample.is_sync,
            });
        }

        Ok(VideoTrackInfo {
            track_id: 1,
            timescale: MEDIA_TIMESCALE,
            width: track.width,
            height: track.height,
            avcc: track.avcc.clone(),
            composition_offset: composition_offset as i64,
            samples,
        })
    }
}

impl ContainerWriter for Mp4Writer {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        if self.track.is_some() {
            return Err(ConvertError::MuxerUsage(
                "MP4 writer supports a single track".into(),
            ));
        }
        if format.mime != mime::VIDEO_AVC {
            return Err(ConvertError::MuxerUsage(format!(
                "Cannot mux {} into MP4",
                format.mime
            )));
        }
        let (width, height) = format
            .dimensions()
            .ok_or_else(|| ConvertError::MuxerUsage("Track format has no dimensions".into()))?;
        let config: &CodecConfig = format
            .codec_config
            .as_ref()
            .ok_or_else(|| ConvertError::MuxerUsage("Track format has no parameter sets".into()))?;
        let avcc = write_avcc_record(config)?;

        debug!(width, height, avcc_len = avcc.len(), "mp4 track added");
        self.track = Some(TrackSetup {
            width,
            height,
            avcc,
            frame_duration_us: format.frame_rate.map(|r| r.frame_duration_us()),
        });
        Ok(0)
    }

    fn start(&mut self) -> Result<()> {
        let mut file = BufWriter::new(File::create(&self.path)?);
        match write_header(&mut file) {
            Ok((mdat_size_pos, position)) => {
                self.mdat_size_pos = mdat_size_pos;
                self.position = position;
                self.file = Some(file);
                info!(path = %self.path.display(), "mp4 output opened");
                Ok(())
            }
            Err(e) => {
                drop(file);
                discard_partial(&self.path);
                Err(e)
            }
        }
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()> {
        if track != 0 {
            return Err(ConvertError::MuxerUsage(format!("No track {track}")));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ConvertError::MuxerUsage("MP4 writer is not started".into()))?;
        let size = u32::try_from(data.len())
            .map_err(|_| ConvertError::MuxerUsage(format!("Sample of {} bytes is too large", data.len())))?;

        file.write_all(data)?;
        trace!(pts_us = info.presentation_time_us, size, key = info.is_key_frame(), "sample");
        self.samples.push(PendingSample {
            offset: self.position,
            size,
            pts_us: info.presentation_time_us,
            is_sync: info.is_key_frame(),
        });
        self.position += size as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let track = self
            .track
            .as_ref()
            .ok_or_else(|| ConvertError::MuxerUsage("MP4 writer has no track".into()))?;
        let info = self.build_track_info(track)?;

        let mut moov = Cursor::new(Vec::new());
        write_moov(&mut moov, &info)?;

        let mut file = self
            .file
            .take()
            .ok_or_else(|| ConvertError::MuxerUsage("MP4 writer is not started".into()))?;
        fill_large_box_size(&mut file, self.mdat_size_pos)?;
        file.write_all(moov.get_ref())?;
        file.flush()?;
        file.get_ref().sync_all()?;

        info!(
            path = %self.path.display(),
            samples = info.samples.len(),
            duration_us = info.duration(),
            "mp4 output finalized"
        );
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            // Unfinished output: flush what was written, the caller decides
            // whether to keep it.
            file.flush()?;
        }
        Ok(())
    }
}

/// Write ftyp and the open mdat header. Returns the position of the mdat
/// size field and of the first sample byte.
fn write_header<W: Write + Seek>(out: &mut W) -> Result<(u64, u64)> {
    write_ftyp(out)?;
    let mdat_size_pos = large_box_size_placeholder(out, b"mdat")?;
    Ok((mdat_size_pos, out.stream_position()?))
}

/// Remove a file whose header never made it to disk.
fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed unstarted output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove unstarted output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vconv_core::{BufferFlags, FrameRate};

    fn avc_format() -> MediaFormat {
        let mut format = MediaFormat::video(mime::VIDEO_AVC, 320, 240);
        format.frame_rate = Some(FrameRate::FPS_25);
        format.codec_config = Some(CodecConfig {
            sps: vec![vec![0x67, 0x42, 0xC0, 0x1E]],
            pps: vec![vec![0x68, 0xCE, 0x3C, 0x80]],
            nal_length_size: 4,
        });
        format
    }

    fn info(pts: i64, key: bool) -> BufferInfo {
        let flags = if key {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::empty()
        };
        BufferInfo::new(0, 4, pts, flags)
    }

    #[test]
    fn test_rejects_non_avc_and_second_track() {
        let mut writer = Mp4Writer::new("unused.mp4");
        assert!(matches!(
            writer.add_track(&MediaFormat::video(mime::VIDEO_HEVC, 1, 1)),
            Err(ConvertError::MuxerUsage(_))
        ));
        assert_eq!(writer.add_track(&avc_format()).unwrap(), 0);
        assert!(matches!(
            writer.add_track(&avc_format()),
            Err(ConvertError::MuxerUsage(_))
        ));
    }

    #[test]
    fn test_rejects_missing_parameter_sets() {
        let mut writer = Mp4Writer::new("unused.mp4");
        let mut format = avc_format();
        format.codec_config = None;
        assert!(matches!(
            writer.add_track(&format),
            Err(ConvertError::MuxerUsage(_))
        ));
    }

    #[test]
    fn test_sample_durations_from_timestamps() {
        let mut writer = Mp4Writer::new("unused.mp4");
        writer.add_track(&avc_format()).unwrap();
        for (i, pts) in [1000i64, 41_000, 81_000, 131_000].into_iter().enumerate() {
            writer.samples.push(PendingSample {
                offset: 100 + i as u64 * 4,
                size: 4,
                pts_us: pts,
                is_sync: i == 0,
            });
        }
        let track = writer.track.as_ref().unwrap();
        let info = writer.build_track_info(track).unwrap();
        let durations: Vec<u32> = info.samples.iter().map(|s| s.duration).collect();
        assert_eq!(durations, vec![40_000, 40_000, 50_000, 50_000]);
        assert_eq!(info.composition_offset, 1000);
    }

    #[test]
    fn test_single_sample_uses_frame_duration() {
        let mut writer = Mp4Writer::new("unused.mp4");
        writer.add_track(&avc_format()).unwrap();
        writer.samples.push(PendingSample {
            offset: 0,
            size: 4,
            pts_us: 0,
            is_sync: true,
        });
        let track = writer.track.as_ref().unwrap();
        let info = writer.build_track_info(track).unwrap();
        assert_eq!(info.samples[0].duration, 40_000);
    }

    #[test]
    fn test_write_before_start_is_rejected() {
        let mut writer = Mp4Writer::new("unused.mp4");
        writer.add_track(&avc_format()).unwrap();
        assert!(matches!(
            writer.write_sample(0, &[0, 0, 0, 0], &info(0, true)),
            Err(ConvertError::MuxerUsage(_))
        ));
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = Mp4Writer::new(&path);
        writer.add_track(&avc_format()).unwrap();
        writer.start().unwrap();
        writer.write_sample(0, &[0, 0, 0, 1], &info(0, true)).unwrap();
        writer.write_sample(0, &[0, 0, 0, 2], &info(40_000, false)).unwrap();
        writer.stop().unwrap();
        writer.release().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        // ftyp is 32 bytes, mdat header follows with extended size
        assert_eq!(&bytes[36..40], b"mdat");
        let mdat_size = u64::from_be_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(mdat_size, 16 + 8);
        assert_eq!(&bytes[48..56], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&bytes[60..64], b"moov");
    }

    #[test]
    fn test_header_layout() {
        let mut out = Cursor::new(Vec::new());
        let (mdat_size_pos, position) = write_header(&mut out).unwrap();
        assert_eq!(mdat_size_pos, 40);
        assert_eq!(position, 48);
    }

    #[test]
    fn test_header_write_failure_is_reported() {
        // Room for ftyp but not for the mdat header
        let mut storage = [0u8; 36];
        let mut out = Cursor::new(&mut storage[..]);
        assert!(matches!(write_header(&mut out), Err(ConvertError::Io(_))));
    }

    #[test]
    fn test_discard_partial_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converted_clip.mp4");
        std::fs::write(&path, b"").unwrap();
        discard_partial(&path);
        assert!(!path.exists());
        // A file that is already gone is not an error
        discard_partial(&path);
    }

    #[test]
    fn test_failed_start_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.mp4");
        let mut writer = Mp4Writer::new(&path);
        writer.add_track(&avc_format()).unwrap();
        assert!(writer.start().is_err());
        assert!(!path.exists());
    }
}
