//! ISO BMFF box (atom) parser.
//!
//! Parses the box hierarchy of MP4/MOV files down to the sample tables:
//! moov, trak, tkhd, mdia, mdhd, hdlr, minf, stbl, stsd and the sample
//! table boxes.
//!
//! Reference: ISO 14496-12 (ISO Base Media File Format).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::{debug, trace};
use vconv_core::{CodecConfig, ConvertError, Result};

use crate::nal::parse_avcc_record;

// ─── Box FourCC constants ────────────────────────────────────────────

/// Convert 4 ASCII bytes to a u32 FourCC code.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

pub const FTYP: u32 = fourcc(b"ftyp");
pub const MOOV: u32 = fourcc(b"moov");
pub const MVHD: u32 = fourcc(b"mvhd");
pub const TRAK: u32 = fourcc(b"trak");
pub const TKHD: u32 = fourcc(b"tkhd");
pub const MDIA: u32 = fourcc(b"mdia");
pub const MDHD: u32 = fourcc(b"mdhd");
pub const HDLR: u32 = fourcc(b"hdlr");
pub const MINF: u32 = fourcc(b"minf");
pub const STBL: u32 = fourcc(b"stbl");
pub const STSD: u32 = fourcc(b"stsd");
pub const STTS: u32 = fourcc(b"stts");
pub const CTTS: u32 = fourcc(b"ctts");
pub const STSC: u32 = fourcc(b"stsc");
pub const STSZ: u32 = fourcc(b"stsz");
pub const STCO: u32 = fourcc(b"stco");
pub const CO64: u32 = fourcc(b"co64");
pub const STSS: u32 = fourcc(b"stss");
pub const MDAT: u32 = fourcc(b"mdat");
pub const AVCC: u32 = fourcc(b"avcC");
pub const BTRT: u32 = fourcc(b"btrt");
pub const AVC1: u32 = fourcc(b"avc1");
pub const AVC3: u32 = fourcc(b"avc3");
pub const HEV1: u32 = fourcc(b"hev1");
pub const HVC1: u32 = fourcc(b"hvc1");
pub const MP4A: u32 = fourcc(b"mp4a");
pub const VIDE: u32 = fourcc(b"vide");
pub const SOUN: u32 = fourcc(b"soun");

/// Convert a FourCC u32 to a human-readable string for logging.
pub fn fourcc_to_string(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

// ─── Box Header ─────────────────────────────────────────────────────

/// A parsed ISO BMFF box header.
#[derive(Clone, Debug)]
pub struct BoxHeader {
    /// FourCC type code.
    pub box_type: u32,
    /// Total box size including the header.
    pub size: u64,
    /// Offset of the box start.
    pub offset: u64,
    /// Size of the header itself (8 or 16 bytes).
    pub header_size: u8,
}

impl BoxHeader {
    /// Byte offset where the box payload starts.
    pub fn content_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Payload size, excluding the header.
    pub fn content_size(&self) -> u64 {
        self.size - self.header_size as u64
    }

    /// Byte offset of the first byte after this box.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Read a box header from the current position. Returns `None` at EOF.
///
/// `limit` is the end of the enclosing box or stream; a size of 0
/// ("extends to end") resolves to it.
pub fn read_box_header<R: Read + Seek>(reader: &mut R, limit: u64) -> Result<Option<BoxHeader>> {
    let offset = reader.stream_position()?;
    if offset + 8 > limit {
        return Ok(None);
    }

    let size32 = reader.read_u32::<BigEndian>()?;
    let box_type = reader.read_u32::<BigEndian>()?;

    let (size, header_size) = match size32 {
        0 => (limit - offset, 8u8),
        1 => (reader.read_u64::<BigEndian>()?, 16u8),
        _ => (size32 as u64, 8u8),
    };

    if size < header_size as u64 || offset + size > limit {
        return Err(ConvertError::Container(format!(
            "Box '{}' at offset {} has invalid size {}",
            fourcc_to_string(box_type),
            offset,
            size
        )));
    }

    trace!(
        box_type = %fourcc_to_string(box_type),
        offset,
        size,
        "box"
    );

    Ok(Some(BoxHeader {
        box_type,
        size,
        offset,
        header_size,
    }))
}

/// Read version and flags of a full box.
fn read_full_box_header<R: Read>(reader: &mut R) -> Result<(u8, u32)> {
    let word = reader.read_u32::<BigEndian>()?;
    Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
}

fn skip<R: Seek>(reader: &mut R, bytes: i64) -> Result<()> {
    reader.seek(SeekFrom::Current(bytes))?;
    Ok(())
}

/// Read `count` fixed-size table entries.
fn read_entries<R: Read, T>(
    reader: &mut R,
    count: u32,
    mut read: impl FnMut(&mut R) -> Result<T>,
) -> Result<Vec<T>> {
    // Counts are untrusted; cap the up-front allocation.
    let mut entries = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        entries.push(read(reader)?);
    }
    Ok(entries)
}

/// Visit every child box between the current position and `end`.
fn for_each_child<R, F>(reader: &mut R, end: u64, mut visit: F) -> Result<()>
where
    R: Read + Seek,
    F: FnMut(&mut R, &BoxHeader) -> Result<()>,
{
    while let Some(header) = read_box_header(reader, end)? {
        visit(reader, &header)?;
        reader.seek(SeekFrom::Start(header.end_offset()))?;
    }
    Ok(())
}

// ─── Parsed structures ──────────────────────────────────────────────

/// stts entry: `count` consecutive samples each lasting `delta` ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

/// ctts entry: composition offset for `count` consecutive samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CttsEntry {
    pub count: u32,
    pub offset: i32,
}

/// stsc entry: chunks from `first_chunk` (1-based) on hold
/// `samples_per_chunk` samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

/// First sample description of a track's stsd.
#[derive(Clone, Debug, Default)]
pub struct SampleDescription {
    /// Sample entry FourCC (avc1, hvc1, mp4a, ...).
    pub codec_fourcc: u32,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub codec_config: Option<CodecConfig>,
    /// Average bit rate from btrt, when present and non-zero.
    pub avg_bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
}

/// Everything parsed from one trak box.
#[derive(Clone, Debug, Default)]
pub struct ParsedTrack {
    pub track_id: u32,
    pub handler_type: u32,
    /// Media timescale (ticks per second).
    pub timescale: u32,
    /// Media duration in timescale ticks.
    pub duration: u64,
    pub tkhd_width: u32,
    pub tkhd_height: u32,
    pub description: Option<SampleDescription>,
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    /// Per-sample sizes; empty when all samples share `default_sample_size`.
    pub sample_sizes: Vec<u32>,
    pub default_sample_size: u32,
    pub sample_count: u32,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers; `None` means every sample is a sync sample.
    pub sync_samples: Option<Vec<u32>>,
}

/// The parsed moov box.
#[derive(Clone, Debug, Default)]
pub struct ParsedMovie {
    pub timescale: u32,
    /// Movie duration in movie timescale ticks.
    pub duration: u64,
    pub tracks: Vec<ParsedTrack>,
    /// Length of the whole file in bytes; 0 when parsed from a bare moov.
    pub file_size: u64,
}

// ─── Top level ──────────────────────────────────────────────────────

/// Locate and parse the moov box of a file.
pub fn read_movie<R: Read + Seek>(reader: &mut R) -> Result<ParsedMovie> {
    let file_end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut moov = None;
    while let Some(header) = read_box_header(reader, file_end)? {
        if header.box_type == MOOV {
            let mut payload = vec![0u8; header.content_size() as usize];
            reader.read_exact(&mut payload)?;
            moov = Some(payload);
            break;
        }
        reader.seek(SeekFrom::Start(header.end_offset()))?;
    }

    let payload = moov.ok_or_else(|| ConvertError::Container("No moov box found".into()))?;
    let mut movie = parse_moov(&payload).map_err(|e| match e {
        ConvertError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            ConvertError::Container("Truncated box inside moov".into())
        }
        other => other,
    })?;
    movie.file_size = file_end;
    Ok(movie)
}

/// Parse the payload of a moov box.
pub fn parse_moov(payload: &[u8]) -> Result<ParsedMovie> {
    let mut reader = Cursor::new(payload);
    let end = payload.len() as u64;
    let mut movie = ParsedMovie::default();

    for_each_child(&mut reader, end, |r, header| {
        match header.box_type {
            MVHD => {
                let (version, _) = read_full_box_header(r)?;
                if version == 1 {
                    skip(r, 16)?;
                    movie.timescale = r.read_u32::<BigEndian>()?;
                    movie.duration = r.read_u64::<BigEndian>()?;
                } else {
                    skip(r, 8)?;
                    movie.timescale = r.read_u32::<BigEndian>()?;
                    movie.duration = r.read_u32::<BigEndian>()? as u64;
                }
                debug!(timescale = movie.timescale, duration = movie.duration, "mvhd");
            }
            TRAK => movie.tracks.push(parse_trak(r, header.end_offset())?),
            _ => {}
        }
        Ok(())
    })?;

    Ok(movie)
}

fn parse_trak<R: Read + Seek>(reader: &mut R, end: u64) -> Result<ParsedTrack> {
    let mut track = ParsedTrack::default();
    for_each_child(reader, end, |r, header| {
        match header.box_type {
            TKHD => parse_tkhd(r, &mut track)?,
            MDIA => parse_mdia(r, header.end_offset(), &mut track)?,
            _ => {}
        }
        Ok(())
    })?;
    debug!(
        track_id = track.track_id,
        handler = %fourcc_to_string(track.handler_type),
        samples = track.sample_count,
        "trak"
    );
    Ok(track)
}

fn parse_tkhd<R: Read + Seek>(reader: &mut R, track: &mut ParsedTrack) -> Result<()> {
    let (version, _) = read_full_box_header(reader)?;
    if version == 1 {
        skip(reader, 16)?;
        track.track_id = reader.read_u32::<BigEndian>()?;
        skip(reader, 4 + 8)?;
    } else {
        skip(reader, 8)?;
        track.track_id = reader.read_u32::<BigEndian>()?;
        skip(reader, 4 + 4)?;
    }
    // reserved (8), layer (2), alt_group (2), volume (2), reserved (2), matrix (36)
    skip(reader, 52)?;
    // 16.16 fixed point
    track.tkhd_width = reader.read_u32::<BigEndian>()? >> 16;
    track.tkhd_height = reader.read_u32::<BigEndian>()? >> 16;
    Ok(())
}

fn parse_mdia<R: Read + Seek>(reader: &mut R, end: u64, track: &mut ParsedTrack) -> Result<()> {
    for_each_child(reader, end, |r, header| {
        match header.box_type {
            MDHD => {
                let (version, _) = read_full_box_header(r)?;
                if version == 1 {
                    skip(r, 16)?;
                    track.timescale = r.read_u32::<BigEndian>()?;
                    track.duration = r.read_u64::<BigEndian>()?;
                } else {
                    skip(r, 8)?;
                    track.timescale = r.read_u32::<BigEndian>()?;
                    track.duration = r.read_u32::<BigEndian>()? as u64;
                }
            }
            HDLR => {
                read_full_box_header(r)?;
                // pre_defined
                skip(r, 4)?;
                track.handler_type = r.read_u32::<BigEndian>()?;
            }
            MINF => {
                for_each_child(r, header.end_offset(), |r, header| {
                    if header.box_type == STBL {
                        parse_stbl(r, header.end_offset(), track)?;
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })
}

fn parse_stbl<R: Read + Seek>(reader: &mut R, end: u64, track: &mut ParsedTrack) -> Result<()> {
    for_each_child(reader, end, |r, header| {
        match header.box_type {
            STSD => track.description = parse_stsd(r, header)?,
            STTS => {
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.stts = read_entries(r, count, |r| {
                    Ok(SttsEntry {
                        count: r.read_u32::<BigEndian>()?,
                        delta: r.read_u32::<BigEndian>()?,
                    })
                })?;
            }
            CTTS => {
                // Version 0 offsets are unsigned, version 1 signed; both
                // fit i32 for any sane stream.
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.ctts = read_entries(r, count, |r| {
                    Ok(CttsEntry {
                        count: r.read_u32::<BigEndian>()?,
                        offset: r.read_i32::<BigEndian>()?,
                    })
                })?;
            }
            STSC => {
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.stsc = read_entries(r, count, |r| {
                    Ok(StscEntry {
                        first_chunk: r.read_u32::<BigEndian>()?,
                        samples_per_chunk: r.read_u32::<BigEndian>()?,
                        sample_description_index: r.read_u32::<BigEndian>()?,
                    })
                })?;
            }
            STSZ => {
                read_full_box_header(r)?;
                track.default_sample_size = r.read_u32::<BigEndian>()?;
                track.sample_count = r.read_u32::<BigEndian>()?;
                if track.default_sample_size == 0 {
                    track.sample_sizes = read_entries(r, track.sample_count, |r| {
                        Ok(r.read_u32::<BigEndian>()?)
                    })?;
                }
            }
            STCO => {
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.chunk_offsets =
                    read_entries(r, count, |r| Ok(r.read_u32::<BigEndian>()? as u64))?;
            }
            CO64 => {
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.chunk_offsets = read_entries(r, count, |r| Ok(r.read_u64::<BigEndian>()?))?;
            }
            STSS => {
                read_full_box_header(r)?;
                let count = r.read_u32::<BigEndian>()?;
                track.sync_samples =
                    Some(read_entries(r, count, |r| Ok(r.read_u32::<BigEndian>()?))?);
            }
            _ => {}
        }
        Ok(())
    })
}

// ─── stsd ───────────────────────────────────────────────────────────

/// Parse the first entry of an stsd box.
fn parse_stsd<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<Option<SampleDescription>> {
    read_full_box_header(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    if entry_count == 0 {
        return Ok(None);
    }
    let Some(entry) = read_box_header(reader, header.end_offset())? else {
        return Ok(None);
    };

    let mut desc = SampleDescription {
        codec_fourcc: entry.box_type,
        ..SampleDescription::default()
    };

    // reserved (6) + data_reference_index (2)
    skip(reader, 8)?;
    match entry.box_type {
        AVC1 | AVC3 | HEV1 | HVC1 => {
            // pre_defined (2), reserved (2), pre_defined (12)
            skip(reader, 16)?;
            desc.width = Some(reader.read_u16::<BigEndian>()?);
            desc.height = Some(reader.read_u16::<BigEndian>()?);
            // resolutions (8), reserved (4), frame_count (2),
            // compressor_name (32), depth (2), pre_defined (2)
            skip(reader, 50)?;
        }
        MP4A => {
            let version = reader.read_u16::<BigEndian>()?;
            // revision (2) + vendor (4)
            skip(reader, 6)?;
            desc.channel_count = Some(reader.read_u16::<BigEndian>()?);
            // sample_size (2), compression_id (2), packet_size (2)
            skip(reader, 6)?;
            desc.sample_rate = Some(reader.read_u32::<BigEndian>()? >> 16);
            // QuickTime sound description v1 and v2 extensions
            match version {
                1 => skip(reader, 16)?,
                2 => skip(reader, 36)?,
                _ => {}
            }
        }
        other => {
            debug!(codec = %fourcc_to_string(other), "stsd: opaque sample entry");
            return Ok(Some(desc));
        }
    }

    for_each_child(reader, entry.end_offset(), |r, child| {
        match child.box_type {
            AVCC => {
                let mut record = vec![0u8; child.content_size() as usize];
                r.read_exact(&mut record)?;
                desc.codec_config = Some(parse_avcc_record(&record)?);
            }
            BTRT => {
                // bufferSizeDB (4), maxBitrate (4)
                skip(r, 8)?;
                let avg = r.read_u32::<BigEndian>()?;
                desc.avg_bitrate = (avg > 0).then_some(avg);
            }
            _ => {}
        }
        Ok(())
    })?;

    debug!(
        codec = %fourcc_to_string(desc.codec_fourcc),
        width = ?desc.width,
        height = ?desc.height,
        "stsd"
    );
    Ok(Some(desc))
}
