//! Encoder target format derivation.

use vconv_core::{ColorFormat, ConvertError, MediaFormat, Result};

/// Key frame interval requested from the encoder, in seconds.
pub const KEYFRAME_INTERVAL_SECS: u32 = 1;

/// Derive the encoder's target format from the selected source track.
///
/// Dimensions, bit rate and frame rate carry over from the source; the key
/// frame interval is fixed and frames arrive through a shared surface.
pub fn negotiate_output_format(source: &MediaFormat, output_mime: &str) -> Result<MediaFormat> {
    let missing = |field: &str| {
        ConvertError::CodecConfiguration(format!(
            "Source track ({}) has no {field}",
            source.mime
        ))
    };
    let (width, height) = source.dimensions().ok_or_else(|| missing("dimensions"))?;
    let bit_rate = source.bit_rate.ok_or_else(|| missing("bit rate"))?;
    let frame_rate = source.frame_rate.ok_or_else(|| missing("frame rate"))?;

    let mut format = MediaFormat::video(output_mime, width, height);
    format.bit_rate = Some(bit_rate);
    format.frame_rate = Some(frame_rate);
    format.keyframe_interval_secs = Some(KEYFRAME_INTERVAL_SECS);
    format.color_format = Some(ColorFormat::Surface);
    Ok(format)
}
