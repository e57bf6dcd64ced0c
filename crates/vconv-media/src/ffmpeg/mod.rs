//! Codec backends driving an ffmpeg child process.
//!
//! The binary is located with ffmpeg-sidecar unless a path is configured.
//! Each backend runs pump threads behind the polling interface of
//! [`DecoderBackend`](crate::codec::DecoderBackend) and
//! [`EncoderBackend`](crate::codec::EncoderBackend).

mod decoder;
mod encoder;
mod process;

use std::time::Duration;

pub use decoder::{FfmpegDecoder, DEFAULT_INPUT_SLOTS};
pub use encoder::{FfmpegEncoder, DEFAULT_PRESET};
pub use process::{ffmpeg_binary, FfmpegProcess};

/// How long `stop` waits for ffmpeg to flush and exit before killing it.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);

/// Whether an ffmpeg binary can be executed.
pub fn is_available(override_path: Option<&std::path::Path>) -> bool {
    std::process::Command::new(ffmpeg_binary(override_path))
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
