//! MP4 box (atom) writers for ISO Base Media File Format (ISO 14496-12).
//!
//! This module writes the structural boxes of an MP4 file: ftyp and moov
//! (mvhd, trak, tkhd, mdia, mdhd, hdlr, minf, stbl). The mdat box is
//! written progressively by [`Mp4Writer`](super::Mp4Writer).

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, Write};
use vconv_core::Result;

use super::atoms::{
    begin_box, begin_full_box, encode_language, fill_box_size, mp4_creation_time,
    write_full_box_header, write_unity_matrix, write_zeros, MOVIE_TIMESCALE,
};

/// Information about a single sample in a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleInfo {
    /// Byte offset of the sample in the file.
    pub offset: u64,
    pub size: u32,
    /// Duration in media timescale units.
    pub duration: u32,
    pub is_sync: bool,
}

/// Describes the video track to be written into the moov box.
#[derive(Clone, Debug)]
pub struct VideoTrackInfo {
    /// 1-based track ID.
    pub track_id: u32,
    pub timescale: u32,
    pub width: u32,
    pub height: u32,
    /// AVCDecoderConfigurationRecord.
    pub avcc: Vec<u8>,
    /// Presentation time of the first sample, in timescale units. Stored
    /// as a constant composition offset so decode times can start at 0.
    pub composition_offset: i64,
    pub samples: Vec<SampleInfo>,
}

impl VideoTrackInfo {
    /// Total duration in timescale units.
    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

/// Write the ftyp (File Type) box.
///
/// Compatible brands: isom, iso2, avc1, mp41
pub fn write_ftyp<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_u32::<BigEndian>(8 + 4 + 4 + 4 * 4)?;
    writer.write_all(b"ftyp")?;
    writer.write_all(b"isom")?; // major brand
    writer.write_u32::<BigEndian>(0x200)?; // minor version
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        writer.write_all(brand)?;
    }
    Ok(())
}

/// Write creation/modification time, optionally a track id, and a
/// duration in version 0 or 1 layout.
fn write_times<W: Write>(writer: &mut W, version: u8, scale_or_id: u32, duration: u64, id_first: bool) -> Result<()> {
    let now = mp4_creation_time();
    if version == 1 {
        writer.write_u64::<BigEndian>(now)?;
        writer.write_u64::<BigEndian>(now)?;
        writer.write_u32::<BigEndian>(scale_or_id)?;
        if id_first {
            write_zeros(writer, 4)?; // reserved
        }
        writer.write_u64::<BigEndian>(duration)?;
    } else {
        writer.write_u32::<BigEndian>(now as u32)?;
        writer.write_u32::<BigEndian>(now as u32)?;
        writer.write_u32::<BigEndian>(scale_or_id)?;
        if id_first {
            write_zeros(writer, 4)?; // reserved
        }
        writer.write_u32::<BigEndian>(duration as u32)?;
    }
    Ok(())
}

fn version_for(duration: u64) -> u8 {
    u8::from(duration > u32::MAX as u64)
}

/// Convert media ticks to movie ticks.
fn to_movie_ticks(ticks: u64, timescale: u32) -> u64 {
    if timescale == 0 {
        return 0;
    }
    (ticks as u128 * MOVIE_TIMESCALE as u128 / timescale as u128) as u64
}

fn write_mvhd<W: Write + Seek>(writer: &mut W, duration: u64, next_track_id: u32) -> Result<()> {
    let version = version_for(duration);
    let pos = begin_full_box(writer, b"mvhd", version, 0)?;
    write_times(writer, version, MOVIE_TIMESCALE, duration, false)?;
    writer.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    writer.write_u16::<BigEndian>(0x0100)?; // volume 1.0
    write_zeros(writer, 10)?; // reserved
    write_unity_matrix(writer)?;
    write_zeros(writer, 24)?; // pre_defined
    writer.write_u32::<BigEndian>(next_track_id)?;
    fill_box_size(writer, pos)
}

fn write_tkhd<W: Write + Seek>(writer: &mut W, track: &VideoTrackInfo, duration: u64) -> Result<()> {
    let version = version_for(duration);
    // flags: track_enabled | track_in_movie
    let pos = begin_full_box(writer, b"tkhd", version, 0x000003)?;
    write_times(writer, version, track.track_id, duration, true)?;
    write_zeros(writer, 8)?; // reserved
    writer.write_i16::<BigEndian>(0)?; // layer
    writer.write_i16::<BigEndian>(0)?; // alternate_group
    writer.write_u16::<BigEndian>(0)?; // volume (video)
    write_zeros(writer, 2)?; // reserved
    write_unity_matrix(writer)?;
    // 16.16 fixed point
    writer.write_u32::<BigEndian>(track.width << 16)?;
    writer.write_u32::<BigEndian>(track.height << 16)?;
    fill_box_size(writer, pos)
}

fn write_mdhd<W: Write + Seek>(writer: &mut W, timescale: u32, duration: u64) -> Result<()> {
    let version = version_for(duration);
    let pos = begin_full_box(writer, b"mdhd", version, 0)?;
    write_times(writer, version, timescale, duration, false)?;
    writer.write_u16::<BigEndian>(encode_language("und"))?;
    writer.write_u16::<BigEndian>(0)?; // pre_defined
    fill_box_size(writer, pos)
}

fn write_hdlr<W: Write + Seek>(writer: &mut W) -> Result<()> {
    let pos = begin_full_box(writer, b"hdlr", 0, 0)?;
    write_zeros(writer, 4)?; // pre_defined
    writer.write_all(b"vide")?;
    write_zeros(writer, 12)?; // reserved
    writer.write_all(b"VideoHandler\0")?;
    fill_box_size(writer, pos)
}

fn write_stsd<W: Write + Seek>(writer: &mut W, track: &VideoTrackInfo) -> Result<()> {
    let pos = begin_full_box(writer, b"stsd", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count

    let entry = begin_box(writer, b"avc1")?;
    write_zeros(writer, 6)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(writer, 16)?; // pre_defined + reserved
    writer.write_u16::<BigEndian>(track.width as u16)?;
    writer.write_u16::<BigEndian>(track.height as u16)?;
    writer.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi horizontal
    writer.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi vertical
    write_zeros(writer, 4)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // frame_count
    write_zeros(writer, 32)?; // compressor_name
    writer.write_u16::<BigEndian>(0x0018)?; // depth
    writer.write_i16::<BigEndian>(-1)?; // pre_defined

    let avcc = begin_box(writer, b"avcC")?;
    writer.write_all(&track.avcc)?;
    fill_box_size(writer, avcc)?;

    fill_box_size(writer, entry)?;
    fill_box_size(writer, pos)
}

/// Run-length encode sample durations: Vec<(count, duration)>.
fn run_length_encode_durations(samples: &[SampleInfo]) -> Vec<(u32, u32)> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for sample in samples {
        match entries.last_mut() {
            Some((count, duration)) if *duration == sample.duration => *count += 1,
            _ => entries.push((1, sample.duration)),
        }
    }
    entries
}

fn write_stbl<W: Write + Seek>(writer: &mut W, track: &VideoTrackInfo) -> Result<()> {
    let pos = begin_box(writer, b"stbl")?;
    let samples = &track.samples;

    write_stsd(writer, track)?;

    let stts = run_length_encode_durations(samples);
    let box_pos = begin_full_box(writer, b"stts", 0, 0)?;
    writer.write_u32::<BigEndian>(stts.len() as u32)?;
    for (count, duration) in &stts {
        writer.write_u32::<BigEndian>(*count)?;
        writer.write_u32::<BigEndian>(*duration)?;
    }
    fill_box_size(writer, box_pos)?;

    if track.composition_offset != 0 && !samples.is_empty() {
        // version 1 allows negative offsets
        let version = u8::from(track.composition_offset < 0);
        let box_pos = begin_full_box(writer, b"ctts", version, 0)?;
        writer.write_u32::<BigEndian>(1)?;
        writer.write_u32::<BigEndian>(samples.len() as u32)?;
        writer.write_i32::<BigEndian>(track.composition_offset as i32)?;
        fill_box_size(writer, box_pos)?;
    }

    // One sample per chunk
    let box_pos = begin_full_box(writer, b"stsc", 0, 0)?;
    if samples.is_empty() {
        writer.write_u32::<BigEndian>(0)?;
    } else {
        writer.write_u32::<BigEndian>(1)?; // entry_count
        writer.write_u32::<BigEndian>(1)?; // first_chunk
        writer.write_u32::<BigEndian>(1)?; // samples_per_chunk
        writer.write_u32::<BigEndian>(1)?; // sample_description_index
    }
    fill_box_size(writer, box_pos)?;

    let box_pos = begin_full_box(writer, b"stsz", 0, 0)?;
    let uniform = samples.first().map(|s| s.size).filter(|&size| samples.iter().all(|s| s.size == size));
    match uniform {
        Some(size) => {
            writer.write_u32::<BigEndian>(size)?;
            writer.write_u32::<BigEndian>(samples.len() as u32)?;
        }
        None => {
            writer.write_u32::<BigEndian>(0)?;
            writer.write_u32::<BigEndian>(samples.len() as u32)?;
            for sample in samples {
                writer.write_u32::<BigEndian>(sample.size)?;
            }
        }
    }
    fill_box_size(writer, box_pos)?;

    if samples.iter().any(|s| s.offset > u32::MAX as u64) {
        let box_pos = begin_full_box(writer, b"co64", 0, 0)?;
        writer.write_u32::<BigEndian>(samples.len() as u32)?;
        for sample in samples {
            writer.write_u64::<BigEndian>(sample.offset)?;
        }
        fill_box_size(writer, box_pos)?;
    } else {
        let box_pos = begin_full_box(writer, b"stco", 0, 0)?;
        writer.write_u32::<BigEndian>(samples.len() as u32)?;
        for sample in samples {
            writer.write_u32::<BigEndian>(sample.offset as u32)?;
        }
        fill_box_size(writer, box_pos)?;
    }

    // Sync samples, 1-based
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let box_pos = begin_full_box(writer, b"stss", 0, 0)?;
    writer.write_u32::<BigEndian>(sync.len() as u32)?;
    for number in &sync {
        writer.write_u32::<BigEndian>(*number)?;
    }
    fill_box_size(writer, box_pos)?;

    fill_box_size(writer, pos)
}

fn write_minf<W: Write + Seek>(writer: &mut W, track: &VideoTrackInfo) -> Result<()> {
    let pos = begin_box(writer, b"minf")?;

    write_full_box_header(writer, b"vmhd", 20, 0, 0x000001)?;
    writer.write_u16::<BigEndian>(0)?; // graphicsmode
    write_zeros(writer, 6)?; // opcolor

    let dinf = begin_box(writer, b"dinf")?;
    let dref = begin_full_box(writer, b"dref", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count
    // self-contained: data lives in this file
    write_full_box_header(writer, b"url ", 12, 0, 0x000001)?;
    fill_box_size(writer, dref)?;
    fill_box_size(writer, dinf)?;

    write_stbl(writer, track)?;
    fill_box_size(writer, pos)
}

/// Write the complete moov box for a single video track.
pub fn write_moov<W: Write + Seek>(writer: &mut W, track: &VideoTrackInfo) -> Result<()> {
    let pos = begin_box(writer, b"moov")?;
    let media_duration = track.duration();
    let movie_duration = to_movie_ticks(media_duration, track.timescale);

    write_mvhd(writer, movie_duration, track.track_id + 1)?;

    let trak = begin_box(writer, b"trak")?;
    write_tkhd(writer, track, movie_duration)?;
    let mdia = begin_box(writer, b"mdia")?;
    write_mdhd(writer, track.timescale, media_duration)?;
    write_hdlr(writer)?;
    write_minf(writer, track)?;
    fill_box_size(writer, mdia)?;
    fill_box_size(writer, trak)?;

    fill_box_size(writer, pos)
}
