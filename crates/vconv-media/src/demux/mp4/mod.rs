//! MP4/MOV demuxer.

pub mod boxes;
pub mod sample;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};
use vconv_core::{
    mime, ticks_to_micros, ConvertError, FrameRate, MediaFormat, MediaTrack, Result,
};

use self::boxes::{ParsedTrack, AVC1, AVC3, HEV1, HVC1, MP4A};
use self::sample::SampleTable;
use super::{Demuxer, SampleMeta};

/// Media type string for a sample entry FourCC.
pub fn mime_for_fourcc(fourcc: u32) -> &'static str {
    match fourcc {
        AVC1 | AVC3 => mime::VIDEO_AVC,
        HEV1 | HVC1 => mime::VIDEO_HEVC,
        MP4A => mime::AUDIO_AAC,
        _ => mime::UNKNOWN,
    }
}

struct TrackData {
    format: MediaFormat,
    table: SampleTable,
}

/// Demuxer over an ISO BMFF file.
pub struct Mp4Demuxer<R = BufReader<File>> {
    reader: Option<R>,
    tracks: Vec<TrackData>,
    duration_us: Option<i64>,
    selected: Option<usize>,
    cursor: usize,
}

impl Mp4Demuxer<BufReader<File>> {
    /// Open a file for demuxing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening container");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    /// Parse the container structure of `reader`.
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let movie = boxes::read_movie(&mut reader)?;

        let movie_duration_us = (movie.timescale > 0 && movie.duration > 0)
            .then(|| ticks_to_micros(movie.duration as i64, movie.timescale));

        let tracks = movie
            .tracks
            .iter()
            .map(|track| {
                let table = SampleTable::build(track, movie.file_size)?;
                let format = track_format(track, &table, movie_duration_us);
                Ok(TrackData { format, table })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(tracks = tracks.len(), duration_us = ?movie_duration_us, "container parsed");

        Ok(Self {
            reader: Some(reader),
            tracks,
            duration_us: movie_duration_us,
            selected: None,
            cursor: 0,
        })
    }

    /// Every track of the container, in index order.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(index, t)| MediaTrack {
                index,
                format: t.format.clone(),
            })
            .collect()
    }

    /// Movie duration from mvhd, in microseconds.
    pub fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    /// Number of samples of a track.
    pub fn sample_count(&self, index: usize) -> Option<usize> {
        self.tracks.get(index).map(|t| t.table.len())
    }
}

/// Derive the public format of a track.
fn track_format(track: &ParsedTrack, table: &SampleTable, movie_duration_us: Option<i64>) -> MediaFormat {
    let desc = track.description.clone().unwrap_or_default();
    let mut format = MediaFormat::new(mime_for_fourcc(desc.codec_fourcc));

    let media_ticks = if track.duration > 0 {
        track.duration
    } else {
        table.decode_duration(&track.stts)
    };
    format.duration_us = if track.timescale > 0 && media_ticks > 0 {
        Some(ticks_to_micros(media_ticks as i64, track.timescale))
    } else {
        movie_duration_us
    };

    if format.is_video() {
        format.width = desc.width.map(u32::from).or((track.tkhd_width > 0).then_some(track.tkhd_width));
        format.height = desc
            .height
            .map(u32::from)
            .or((track.tkhd_height > 0).then_some(track.tkhd_height));
        format.frame_rate =
            FrameRate::from_sample_timing(table.len() as u64, media_ticks, track.timescale);
    }

    format.bit_rate = desc.avg_bitrate.or_else(|| {
        let micros = format.duration_us.filter(|&d| d > 0)?;
        let bits = table.total_bytes() as u128 * 8 * 1_000_000 / micros as u128;
        u32::try_from(bits).ok()
    });
    format.codec_config = desc.codec_config;
    format.sample_rate = desc.sample_rate;
    format.channel_count = desc.channel_count;
    format
}

impl<R: Read + Seek> Demuxer for Mp4Demuxer<R> {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<MediaFormat> {
        self.tracks
            .get(index)
            .map(|t| t.format.clone())
            .ok_or_else(|| ConvertError::Container(format!("No track {index}")))
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(ConvertError::Container(format!("No track {index}")));
        }
        if let Some(current) = self.selected {
            return Err(ConvertError::invalid_state(
                "demuxer",
                "select track",
                format!("track {current} selected"),
            ));
        }
        self.selected = Some(index);
        self.cursor = 0;
        debug!(index, mime = %self.tracks[index].format.mime, "track selected");
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ConvertError::invalid_state("demuxer", "read sample", "Released"))?;
        let track = self
            .selected
            .ok_or_else(|| ConvertError::invalid_state("demuxer", "read sample", "NoTrackSelected"))?;
        let table = &self.tracks[track].table;
        let Some(entry) = table.samples.get(self.cursor) else {
            return Ok(None);
        };

        buf.clear();
        buf.resize(entry.size as usize, 0);
        reader.seek(SeekFrom::Start(entry.offset))?;
        reader.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ConvertError::Container(format!(
                "Sample {} at offset {} runs past end of file",
                self.cursor, entry.offset
            )),
            _ => ConvertError::Io(e),
        })?;

        Ok(Some(SampleMeta {
            size: entry.size as usize,
            presentation_time_us: ticks_to_micros(entry.cts, table.timescale),
            key_frame: entry.is_sync,
        }))
    }

    fn advance(&mut self) -> bool {
        let Some(track) = self.selected else {
            return false;
        };
        let len = self.tracks[track].table.len();
        if self.cursor < len {
            self.cursor += 1;
        }
        self.cursor < len
    }

    fn release(&mut self) -> Result<()> {
        if self.reader.take().is_some() {
            debug!("demuxer released");
        }
        Ok(())
    }
}
