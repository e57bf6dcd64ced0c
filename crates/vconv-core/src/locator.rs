//! Locators for source and destination media.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ConvertError, Result};

/// Identifies a media file. Accepts plain paths and `file://` URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaLocator {
    path: PathBuf,
}

impl MediaLocator {
    /// Locator for a filesystem path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse a path or URI. Schemes other than `file` are rejected.
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(rest) = input.strip_prefix("file://") {
            // `file://localhost/x` and `file:///x` both name `/x`.
            let rest = rest.strip_prefix("localhost").unwrap_or(rest);
            if rest.is_empty() {
                return Err(ConvertError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Empty file URI: {input}"),
                )));
            }
            return Ok(Self::from_path(percent_decode(rest)?));
        }
        if let Some((scheme, _)) = input.split_once("://") {
            return Err(ConvertError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("Unsupported locator scheme '{scheme}'"),
            )));
        }
        Ok(Self::from_path(input))
    }

    /// Get the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Human-readable name of the media: its final path component.
    pub fn display_name(&self) -> Result<String> {
        let name = self.path.file_name().ok_or_else(|| {
            ConvertError::DisplayNameResolution(format!(
                "'{}' has no file name component",
                self.path.display()
            ))
        })?;
        let name = name.to_str().ok_or_else(|| {
            ConvertError::DisplayNameResolution(format!(
                "file name of '{}' is not valid UTF-8",
                self.path.display()
            ))
        })?;
        if name.trim().is_empty() {
            return Err(ConvertError::DisplayNameResolution(format!(
                "'{}' has a blank file name",
                self.path.display()
            )));
        }
        Ok(name.to_string())
    }
}

/// Decode `%XX` escapes in a URI path.
fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                    continue;
                }
                None => {
                    return Err(ConvertError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Bad percent escape in '{input}'"),
                    )))
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).map_err(|_| {
        ConvertError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("'{input}' does not decode to UTF-8"),
        ))
    })
}

impl fmt::Display for MediaLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<PathBuf> for MediaLocator {
    fn from(path: PathBuf) -> Self {
        Self::from_path(path)
    }
}

impl From<&Path> for MediaLocator {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}
