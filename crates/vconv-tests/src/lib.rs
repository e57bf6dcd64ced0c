//! Integration test crate for vconv.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the pipeline coordinator over scripted codecs and the real
//! MP4 container code.

#[cfg(test)]
mod mock;

#[cfg(test)]
mod pipeline;

#[cfg(test)]
mod container;

#[cfg(test)]
mod native;
