#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Real-time mixer buffer that aligns independently clocked audio sources by
//! host timestamp.
//!
//! Sources either push interleaved PCM through [`MixerBuffer::enqueue`] or
//! supply it on demand through a [`PullSource`]. Every source is converted to
//! the canonical `f32` format, aligned on a shared timeline and mixed with
//! per-source volume and pan by the [`Renderer`], whose methods are lock and
//! allocation free so they can run inside an audio callback.

use std::sync::Once;

pub mod clock;
pub mod config;
pub mod convert;
pub mod error;
pub mod ffi;
pub mod format;
pub mod mixer;
mod registry;
pub mod ring;
pub mod source;
mod sync;

#[cfg(test)]
mod tests;

pub use clock::{FrameClock, host_ticks_per_second, host_time_now, host_time_to_ns};
pub use config::MixerConfig;
pub use error::MixerError;
pub use format::{AudioFormat, MAX_CHANNELS, SampleBuffer, SampleBufferMut, SampleFormat};
pub use mixer::{MixerBuffer, MixerStatus, Peek, Renderer, SourceStatus, pan_gains};
pub use registry::{SourceMode, SourceState};
pub use source::{PullFn, PullSource, SourceId, pull_fn};

static TRACING_INIT: Once = Once::new();

/// Install the `tracing-subscriber` formatter once per process.
///
/// A subscriber installed by the host application takes precedence.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
