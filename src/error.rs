//! Errors returned by control-side operations.

use crate::format::AudioFormat;
use crate::registry::SourceMode;
use crate::source::SourceId;

/// Error enumeration surfaced across the public API.
///
/// Only control-side operations return these. The render path degrades to
/// silence instead of failing.
#[derive(thiserror::Error, Debug)]
pub enum MixerError {
    /// The format cannot be used where it was supplied.
    #[error("unsupported audio format {0:?}")]
    UnsupportedFormat(AudioFormat),
    /// A configuration value is out of range.
    #[error("invalid mixer configuration: {0}")]
    InvalidConfig(&'static str),
    /// The registry already holds the configured maximum number of sources.
    #[error("source limit of {0} reached")]
    TooManySources(usize),
    /// Ring or scratch storage for a new source could not be reserved.
    #[error("could not allocate {frames} frames for source {id}")]
    Allocation {
        /// Source whose storage failed.
        id: SourceId,
        /// Requested capacity in frames.
        frames: usize,
    },
    /// A push source was given callbacks, or a pull source was enqueued to.
    #[error("source {id} is already registered as {existing:?}")]
    ModeConflict {
        /// Offending source.
        id: SourceId,
        /// Mode established at first contact.
        existing: SourceMode,
    },
    /// Interleaved sample data is not a whole number of frames.
    #[error("{samples} samples do not divide into {channels}-channel frames")]
    MisalignedBuffer {
        /// Sample count supplied.
        samples: usize,
        /// Channel count of the declared format.
        channels: u16,
    },
}
