//! H.264 NAL unit tools: AVCC and Annex-B framing, access unit splitting
//! and the avcC decoder configuration record.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::io::{Cursor, Read};
use vconv_core::{CodecConfig, ConvertError, Result};

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    SliceA,
    SliceB,
    SliceC,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndSeq,
    EndStream,
    FillerData,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            2 => Self::SliceA,
            3 => Self::SliceB,
            4 => Self::SliceC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndSeq,
            11 => Self::EndStream,
            12 => Self::FillerData,
            other => Self::Other(other),
        }
    }
}

impl H264NalType {
    /// Whether the NAL carries coded slice data.
    pub fn is_vcl(self) -> bool {
        matches!(
            self,
            Self::Slice | Self::SliceA | Self::SliceB | Self::SliceC | Self::Idr
        )
    }

    /// Whether this NAL type, following slice data, opens a new access unit.
    fn starts_access_unit(self) -> bool {
        match self {
            Self::Aud | Self::Sps | Self::Pps | Self::Sei => true,
            Self::Other(t) => (14..=18).contains(&t),
            _ => false,
        }
    }
}

/// Extract the NAL unit type from the first byte of NAL data.
pub fn nal_unit_type(nal_first_byte: u8) -> H264NalType {
    H264NalType::from(nal_first_byte)
}

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Split a sample into its length-prefixed NAL units.
pub fn avcc_nal_units(data: &[u8], length_size: u8) -> Result<SmallVec<[&[u8]; 4]>> {
    let ls = length_size as usize;
    if !(1..=4).contains(&ls) || ls == 3 {
        return Err(ConvertError::Container(format!(
            "Invalid NAL length size {length_size}"
        )));
    }
    let mut units = SmallVec::new();
    let mut offset = 0;
    while offset < data.len() {
        if offset + ls > data.len() {
            return Err(ConvertError::Container(format!(
                "Truncated NAL length at offset {offset}"
            )));
        }
        let nal_len = data[offset..offset + ls]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        offset += ls;
        if offset + nal_len > data.len() {
            return Err(ConvertError::Container(format!(
                "NAL of {nal_len} bytes overruns sample of {} bytes",
                data.len()
            )));
        }
        units.push(&data[offset..offset + nal_len]);
        offset += nal_len;
    }
    Ok(units)
}

/// Convert AVCC-formatted NAL units to Annex-B format.
///
/// AVCC: `[length_size bytes length][NAL data]...`
/// Annex-B: `[0x00 0x00 0x00 0x01][NAL data]...`
pub fn avcc_to_annexb(avcc_data: &[u8], length_size: u8, out: &mut Vec<u8>) -> Result<()> {
    for nal in avcc_nal_units(avcc_data, length_size)? {
        out.extend_from_slice(&ANNEXB_START_CODE);
        out.extend_from_slice(nal);
    }
    Ok(())
}

/// Append parameter sets in Annex-B framing.
pub fn write_parameter_sets_annexb(config: &CodecConfig, out: &mut Vec<u8>) {
    for nal in config.sps.iter().chain(config.pps.iter()) {
        out.extend_from_slice(&ANNEXB_START_CODE);
        out.extend_from_slice(nal);
    }
}

/// Append NAL units with 4-byte big-endian length prefixes.
pub fn write_avcc_nals<'a>(nals: impl IntoIterator<Item = &'a [u8]>, out: &mut Vec<u8>) {
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
}

/// Find the next 3-byte start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// Trailing zero bytes belong to the next (4-byte) start code.
fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &nal[..end]
}

/// Split a complete Annex-B buffer into NAL units (without start codes).
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let Some(first) = find_start_code(data, 0) else {
        return units;
    };
    let mut start = first + 3;
    while let Some(next) = find_start_code(data, start) {
        let nal = trim_trailing_zeros(&data[start..next]);
        if !nal.is_empty() {
            units.push(nal);
        }
        start = next + 3;
    }
    let nal = trim_trailing_zeros(&data[start..]);
    if !nal.is_empty() {
        units.push(nal);
    }
    units
}

/// One coded picture: every NAL unit between two access unit boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnit {
    pub nals: Vec<Vec<u8>>,
}

impl AccessUnit {
    /// Whether the picture is an IDR picture.
    pub fn is_idr(&self) -> bool {
        self.nals
            .iter()
            .any(|n| !n.is_empty() && nal_unit_type(n[0]) == H264NalType::Idr)
    }

    /// Whether the access unit holds a coded slice.
    pub fn has_vcl(&self) -> bool {
        self.nals
            .iter()
            .any(|n| !n.is_empty() && nal_unit_type(n[0]).is_vcl())
    }

    /// Parameter sets carried in-band by this access unit.
    pub fn parameter_sets(&self) -> CodecConfig {
        let mut config = CodecConfig {
            nal_length_size: 4,
            ..CodecConfig::default()
        };
        for nal in self.nals.iter().filter(|n| !n.is_empty()) {
            match nal_unit_type(nal[0]) {
                H264NalType::Sps => config.sps.push(nal.clone()),
                H264NalType::Pps => config.pps.push(nal.clone()),
                _ => {}
            }
        }
        config
    }

    /// Payload in 4-byte AVCC framing, without delimiters or parameter sets.
    pub fn to_avcc(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_avcc_nals(
            self.nals.iter().map(Vec::as_slice).filter(|n| {
                !n.is_empty()
                    && !matches!(
                        nal_unit_type(n[0]),
                        H264NalType::Aud | H264NalType::Sps | H264NalType::Pps
                    )
            }),
            &mut out,
        );
        out
    }
}

/// Incremental splitter turning an Annex-B byte stream into access units.
///
/// A new access unit begins at an access unit delimiter, at parameter sets
/// or SEI following slice data, or at a slice whose `first_mb_in_slice` is
/// zero once the current unit already holds slice data.
#[derive(Debug, Default)]
pub struct AccessUnitSplitter {
    buf: Vec<u8>,
    /// Offset of the payload of the NAL currently being accumulated.
    nal_start: Option<usize>,
    scan_pos: usize,
    current: AccessUnit,
}

impl AccessUnitSplitter {
    /// Splitter with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every access unit completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<AccessUnit> {
        self.buf.extend_from_slice(data);
        let mut done = Vec::new();

        loop {
            let Some(sc) = find_start_code(&self.buf, self.scan_pos) else {
                // A start code may straddle the next chunk.
                self.scan_pos = self
                    .buf
                    .len()
                    .saturating_sub(2)
                    .max(self.nal_start.unwrap_or(0));
                break;
            };
            if let Some(start) = self.nal_start {
                let nal = trim_trailing_zeros(&self.buf[start..sc]).to_vec();
                if let Some(au) = self.accept_nal(nal) {
                    done.push(au);
                }
            }
            self.nal_start = Some(sc + 3);
            self.scan_pos = sc + 3;
        }

        // Compact consumed bytes.
        let keep_from = self.nal_start.unwrap_or(self.scan_pos).min(self.buf.len());
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.scan_pos -= keep_from;
            self.nal_start = self.nal_start.map(|s| s - keep_from);
        }
        done
    }

    /// Flush at end of stream, returning the units still pending.
    pub fn finish(&mut self) -> Vec<AccessUnit> {
        let mut done = Vec::new();
        if let Some(start) = self.nal_start.take() {
            let nal = trim_trailing_zeros(&self.buf[start..]).to_vec();
            done.extend(self.accept_nal(nal));
        }
        self.buf.clear();
        self.scan_pos = 0;
        let last = std::mem::take(&mut self.current);
        if !last.nals.is_empty() {
            done.push(last);
        }
        done
    }

    fn accept_nal(&mut self, nal: Vec<u8>) -> Option<AccessUnit> {
        if nal.is_empty() {
            return None;
        }
        let kind = nal_unit_type(nal[0]);
        let boundary = if kind == H264NalType::Aud {
            !self.current.nals.is_empty()
        } else if kind.starts_access_unit() {
            self.current.has_vcl()
        } else if kind.is_vcl() {
            let first_mb_zero = nal.get(1).is_some_and(|b| b & 0x80 != 0);
            first_mb_zero && self.current.has_vcl()
        } else {
            false
        };
        let finished = if boundary {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };
        self.current.nals.push(nal);
        finished
    }
}

/// Parse an AVCDecoderConfigurationRecord (the payload of an `avcC` box).
pub fn parse_avcc_record(data: &[u8]) -> Result<CodecConfig> {
    let mut reader = Cursor::new(data);
    let truncated = |_| ConvertError::Container("Truncated avcC record".into());

    let config_version = reader.read_u8().map_err(truncated)?;
    if config_version != 1 {
        return Err(ConvertError::Container(format!(
            "Unexpected avcC version: {config_version}"
        )));
    }
    // profile, profile compatibility, level
    let mut profile_level = [0u8; 3];
    reader.read_exact(&mut profile_level).map_err(truncated)?;

    let nal_length_size = (reader.read_u8().map_err(truncated)? & 0x03) + 1;

    let sps_count = (reader.read_u8().map_err(truncated)? & 0x1F) as usize;
    let mut sps = Vec::with_capacity(sps_count);
    for _ in 0..sps_count {
        let len = reader.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let mut nal = vec![0u8; len];
        reader.read_exact(&mut nal).map_err(truncated)?;
        sps.push(nal);
    }

    let pps_count = reader.read_u8().map_err(truncated)? as usize;
    let mut pps = Vec::with_capacity(pps_count);
    for _ in 0..pps_count {
        let len = reader.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let mut nal = vec![0u8; len];
        reader.read_exact(&mut nal).map_err(truncated)?;
        pps.push(nal);
    }

    Ok(CodecConfig {
        sps,
        pps,
        nal_length_size,
    })
}

/// Serialize parameter sets as an AVCDecoderConfigurationRecord.
pub fn write_avcc_record(config: &CodecConfig) -> Result<Vec<u8>> {
    let first_sps = config
        .sps
        .first()
        .filter(|sps| sps.len() >= 4)
        .ok_or_else(|| ConvertError::MuxerUsage("avcC needs a complete SPS".into()))?;
    if config.pps.is_empty() {
        return Err(ConvertError::MuxerUsage("avcC needs at least one PPS".into()));
    }
    if config.sps.len() > 31 || config.pps.len() > 255 {
        return Err(ConvertError::MuxerUsage("Too many parameter sets".into()));
    }
    let length_size = match config.nal_length_size {
        0 => 4,
        n => n,
    };

    let mut out = Vec::new();
    out.write_u8(1)?;
    // profile_idc, constraint flags, level_idc straight from the SPS
    out.extend_from_slice(&first_sps[1..4]);
    out.write_u8(0xFC | ((length_size - 1) & 0x03))?;
    out.write_u8(0xE0 | config.sps.len() as u8)?;
    for sps in &config.sps {
        out.write_u16::<BigEndian>(sps.len() as u16)?;
        out.extend_from_slice(sps);
    }
    out.write_u8(config.pps.len() as u8)?;
    for pps in &config.pps {
        out.write_u16::<BigEndian>(pps.len() as u16)?;
        out.extend_from_slice(pps);
    }
    Ok(out)
}
