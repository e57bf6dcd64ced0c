//! Source track selection.

use tracing::debug;
use vconv_core::{ConvertError, MediaTrack, Result};

use crate::demux::Demuxer;

/// Select the lowest-index track whose media type starts with `prefix` and
/// make it the demuxer's active track.
pub fn select_track<D: Demuxer + ?Sized>(demuxer: &mut D, prefix: &str) -> Result<MediaTrack> {
    for index in 0..demuxer.track_count() {
        let format = demuxer.track_format(index)?;
        if format.mime.starts_with(prefix) {
            demuxer.select_track(index)?;
            debug!(index, mime = %format.mime, "selected source track");
            return Ok(MediaTrack { index, format });
        }
    }
    Err(ConvertError::NoMatchingTrack {
        prefix: prefix.to_string(),
    })
}
