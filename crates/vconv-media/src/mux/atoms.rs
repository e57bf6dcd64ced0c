//! Low-level MP4 atom/box writing primitives.
//!
//! MP4 files are structured as nested boxes (atoms). Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "ftyp", "moov", "mdat")
//!
//! "Full boxes" additionally have:
//! - 1-byte version
//! - 3-byte flags

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};
use vconv_core::{ConvertError, Result};

/// Movie-level timescale (millisecond precision).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Media timescale for video tracks. Timestamps arrive in microseconds, so
/// they are stored without rounding.
pub const MEDIA_TIMESCALE: u32 = 1_000_000;

/// Write a "full box" header: 4-byte size + 4-byte type + 1-byte version + 3-byte flags.
pub fn write_full_box_header<W: Write>(
    writer: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> Result<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(())
}

/// Write a size placeholder followed by the box type. Returns the position
/// to hand to [`fill_box_size`] once the box content is written.
pub fn begin_box<W: Write + Seek>(writer: &mut W, box_type: &[u8; 4]) -> Result<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_all(box_type)?;
    Ok(pos)
}

/// [`begin_box`] for a full box.
pub fn begin_full_box<W: Write + Seek>(
    writer: &mut W,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
) -> Result<u64> {
    let pos = begin_box(writer, box_type)?;
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(pos)
}

/// Patch the box size at `size_pos` with the distance to the current position.
pub fn fill_box_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> Result<()> {
    let current = writer.stream_position()?;
    let size = u32::try_from(current - size_pos).map_err(|_| {
        ConvertError::MuxerUsage(format!(
            "Box size {} exceeds 32-bit limit",
            current - size_pos
        ))
    })?;
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u32::<BigEndian>(size)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Write a 64-bit box header with a zero size and return the position of
/// the extended size field.
pub fn large_box_size_placeholder<W: Write + Seek>(
    writer: &mut W,
    box_type: &[u8; 4],
) -> Result<u64> {
    writer.write_u32::<BigEndian>(1)?; // size=1 signals extended size
    writer.write_all(box_type)?;
    let size_pos = writer.stream_position()?;
    writer.write_u64::<BigEndian>(0)?;
    Ok(size_pos)
}

/// Fill in a 64-bit extended size. `size_pos` points to the extended size
/// field, 8 bytes past the box start.
pub fn fill_large_box_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> Result<()> {
    let current = writer.stream_position()?;
    let total_size = current - (size_pos - 8);
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u64::<BigEndian>(total_size)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Write zero padding bytes.
pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> Result<()> {
    writer.write_all(&vec![0u8; count])?;
    Ok(())
}

/// Write the unity transformation matrix used by mvhd and tkhd.
pub fn write_unity_matrix<W: Write>(writer: &mut W) -> Result<()> {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        writer.write_u32::<BigEndian>(value)?;
    }
    Ok(())
}

/// ISO 639-2/T language code packed into 3x5 bits.
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_lowercase) {
        return encode_language("und");
    }
    bytes[..3]
        .iter()
        .fold(0u16, |acc, &b| (acc << 5) | (b - 0x60) as u16)
}

/// Seconds between the MP4 epoch (1904-01-01) and the Unix epoch.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current time as seconds since the MP4 epoch.
pub fn mp4_creation_time() -> u64 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    MP4_EPOCH_OFFSET + unix
}
