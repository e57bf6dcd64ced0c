//! Sample table interpretation: maps sample indices to file byte offsets,
//! sizes, timestamps and keyframe status.
//!
//! Uses the parsed stsc, stsz, stco/co64, stts, ctts and stss data to
//! build a flat index of samples.

use tracing::debug;
use vconv_core::{ConvertError, Result};

use super::boxes::{CttsEntry, ParsedTrack, StscEntry, SttsEntry};

/// Flat entry for a single sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    /// Byte offset in the file where this sample's data starts.
    pub offset: u64,
    pub size: u32,
    /// Decoding timestamp in media timescale units.
    pub dts: u64,
    /// Composition (presentation) timestamp in media timescale units.
    pub cts: i64,
    pub is_sync: bool,
}

/// Pre-computed sample table for one track, in decode order.
#[derive(Clone, Debug, Default)]
pub struct SampleTable {
    pub samples: Vec<SampleEntry>,
    /// Media timescale (ticks per second).
    pub timescale: u32,
}

impl SampleTable {
    /// Build a `SampleTable` from parsed track data.
    ///
    /// `file_size` bounds the sample count: every sample occupies at least
    /// one byte of the file.
    pub fn build(track: &ParsedTrack, file_size: u64) -> Result<Self> {
        let sample_count = track.sample_count as usize;
        if sample_count == 0 {
            return Ok(SampleTable {
                samples: Vec::new(),
                timescale: track.timescale,
            });
        }

        let min_bytes = track.sample_count as u64 * track.default_sample_size.max(1) as u64;
        if min_bytes > file_size {
            return Err(ConvertError::Container(format!(
                "Track {} declares {} samples ({} bytes) in a {} byte file",
                track.track_id, track.sample_count, min_bytes, file_size
            )));
        }

        let offsets_and_sizes = build_sample_offsets(
            &track.stsc,
            &track.chunk_offsets,
            &track.sample_sizes,
            track.default_sample_size,
            sample_count,
        )?;
        let dts_array = build_dts_array(&track.stts, sample_count);
        let cts_offsets = build_cts_offsets(&track.ctts, sample_count);

        let samples: Vec<SampleEntry> = offsets_and_sizes
            .into_iter()
            .zip(dts_array)
            .zip(cts_offsets)
            .enumerate()
            .map(|(i, (((offset, size), dts), cts_offset))| SampleEntry {
                offset,
                size,
                dts,
                cts: dts as i64 + cts_offset as i64,
                is_sync: match &track.sync_samples {
                    None => true,
                    Some(sync) => sync.binary_search(&(i as u32 + 1)).is_ok(),
                },
            })
            .collect();

        debug!(
            samples = samples.len(),
            timescale = track.timescale,
            "sample table built"
        );

        Ok(SampleTable {
            samples,
            timescale: track.timescale,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total payload bytes over all samples.
    pub fn total_bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.size as u64).sum()
    }

    /// Sum of all sample durations, in timescale ticks.
    pub fn decode_duration(&self, stts: &[SttsEntry]) -> u64 {
        let covered: u64 = stts.iter().map(|e| e.count as u64 * e.delta as u64).sum();
        covered.max(self.samples.last().map_or(0, |s| s.dts))
    }
}

/// Up-front capacity for per-sample vectors; counts come from the file.
fn capacity_for(sample_count: usize) -> usize {
    sample_count.min(1 << 16)
}

/// Build (file_offset, size) for each sample, using stsc + stco + stsz.
fn build_sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sample_sizes: &[u32],
    default_sample_size: u32,
    sample_count: usize,
) -> Result<Vec<(u64, u32)>> {
    let mut result = Vec::with_capacity(capacity_for(sample_count));
    let mut sample_idx = 0usize;

    for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        // chunk numbers are 1-based in stsc
        let samples_in_chunk = samples_per_chunk_for(stsc, chunk_idx as u32 + 1);
        let mut offset = chunk_offset;

        for _ in 0..samples_in_chunk {
            if sample_idx >= sample_count {
                break;
            }
            let size = if default_sample_size > 0 {
                default_sample_size
            } else {
                *sample_sizes.get(sample_idx).ok_or_else(|| {
                    ConvertError::Container(format!(
                        "Sample index {} exceeds stsz table length {}",
                        sample_idx,
                        sample_sizes.len()
                    ))
                })?
            };
            result.push((offset, size));
            offset += size as u64;
            sample_idx += 1;
        }
    }

    if result.len() != sample_count {
        return Err(ConvertError::Container(format!(
            "Built {} sample offsets but expected {} (stsc/stco/stsz mismatch)",
            result.len(),
            sample_count
        )));
    }
    Ok(result)
}

/// Samples in the given 1-based chunk: the last stsc entry whose
/// `first_chunk` is at or before it applies.
fn samples_per_chunk_for(stsc: &[StscEntry], chunk_num: u32) -> u32 {
    stsc.iter()
        .take_while(|e| e.first_chunk <= chunk_num)
        .last()
        .map_or(1, |e| e.samples_per_chunk)
}

/// Decoding timestamps from stts, padded with the last delta when stts
/// covers fewer samples than stsz.
fn build_dts_array(stts: &[SttsEntry], sample_count: usize) -> Vec<u64> {
    let mut dts_array = Vec::with_capacity(capacity_for(sample_count));
    let mut dts = 0u64;

    'outer: for entry in stts {
        for _ in 0..entry.count {
            if dts_array.len() >= sample_count {
                break 'outer;
            }
            dts_array.push(dts);
            dts += entry.delta as u64;
        }
    }

    let last_delta = stts.last().map_or(1, |e| e.delta as u64);
    while dts_array.len() < sample_count {
        dts_array.push(dts);
        dts += last_delta;
    }
    dts_array
}

/// One composition offset per sample, 0 where ctts is silent.
fn build_cts_offsets(ctts: &[CttsEntry], sample_count: usize) -> Vec<i32> {
    let mut offsets: Vec<i32> = ctts
        .iter()
        .flat_map(|e| std::iter::repeat(e.offset).take(e.count as usize))
        .take(sample_count)
        .collect();
    offsets.resize(sample_count, 0);
    offsets
}
