//! Destination path derivation.

use std::path::{Path, PathBuf};
use tracing::debug;
use vconv_core::{MediaLocator, Result};

/// Prefix of every converted file name.
pub const OUTPUT_PREFIX: &str = "converted_";

/// Places converted files into one output directory.
#[derive(Debug, Clone)]
pub struct OutputPathResolver {
    output_dir: PathBuf,
}

impl OutputPathResolver {
    /// Resolver writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Resolver for the platform movies directory, or the local data
    /// directory where there is none.
    pub fn platform_default() -> Self {
        Self::new(default_output_dir())
    }

    /// Get the output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Destination for `source`: `<output dir>/converted_<display name>`.
    /// Creates the output directory.
    pub fn resolve(&self, source: &MediaLocator) -> Result<PathBuf> {
        let name = source.display_name()?;
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{OUTPUT_PREFIX}{name}"));
        debug!(path = %path.display(), "resolved output path");
        Ok(path)
    }
}

/// `<movies>/vconv`, falling back to `<local data>/vconv`, then the
/// working directory.
pub fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("vconv"))
        .unwrap_or_else(|| PathBuf::from("vconv-output"))
}
