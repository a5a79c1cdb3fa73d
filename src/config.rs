//! Mixer construction parameters.

use std::time::Duration;

use crate::clock::host_ticks_per_second;
use crate::error::MixerError;
use crate::format::{AudioFormat, SampleFormat};

/// Construction parameters for a [`MixerBuffer`](crate::MixerBuffer).
#[derive(Clone, Debug)]
pub struct MixerConfig {
    /// Canonical format: what the mixer outputs and mixes in. Must be `f32`.
    pub format: AudioFormat,
    /// Largest number of frames processed per internal slice; sizes all scratch storage.
    pub max_frames_per_slice: usize,
    /// Capacity of each push source's ring, in canonical frames.
    pub ring_capacity_frames: usize,
    /// Upper bound on simultaneously registered sources.
    pub max_sources: usize,
    /// Consecutive render calls without data after which a source is evicted.
    pub stale_cycles: u32,
    /// Depth of the control-to-render command queue.
    pub command_capacity: usize,
    /// How long synchronous registration waits for the render thread.
    pub sync_timeout: Duration,
    /// Host ticks per second of the timestamps callers supply.
    pub host_ticks_per_second: f64,
}

impl MixerConfig {
    /// Defaults for `format`, with two seconds of ring capacity per push source.
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            ring_capacity_frames: format.sample_rate as usize * 2,
            ..Self::default()
        }
    }

    /// Check every field is usable.
    pub fn validate(&self) -> Result<(), MixerError> {
        if !self.format.is_valid() || self.format.sample_format != SampleFormat::F32 {
            return Err(MixerError::UnsupportedFormat(self.format));
        }
        if self.max_frames_per_slice == 0 {
            return Err(MixerError::InvalidConfig("max_frames_per_slice must be non-zero"));
        }
        if self.ring_capacity_frames == 0 {
            return Err(MixerError::InvalidConfig("ring_capacity_frames must be non-zero"));
        }
        if self.max_sources == 0 {
            return Err(MixerError::InvalidConfig("max_sources must be non-zero"));
        }
        if self.command_capacity == 0 {
            return Err(MixerError::InvalidConfig("command_capacity must be non-zero"));
        }
        if !(self.host_ticks_per_second.is_finite() && self.host_ticks_per_second > 0.0) {
            return Err(MixerError::InvalidConfig("host_ticks_per_second must be positive"));
        }
        Ok(())
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::f32(48_000, 2),
            max_frames_per_slice: 4_096,
            ring_capacity_frames: 96_000,
            max_sources: 32,
            // About 1.4 s of 256-frame slices at 48 kHz.
            stale_cycles: 256,
            command_capacity: 64,
            sync_timeout: Duration::from_millis(500),
            host_ticks_per_second: host_ticks_per_second(),
        }
    }
}
