//! Host tick time domain shared by callers and the mixer clock.
//!
//! On macOS host ticks are `mach_absolute_time` units; elsewhere they are
//! nanoseconds since the first call into this module.

use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Host ticks per second for this process.
pub fn host_ticks_per_second() -> f64 {
    #[cfg(target_os = "macos")]
    {
        let (numer, denom) = timebase();
        1_000_000_000.0 * denom as f64 / numer as f64
    }
    #[cfg(not(target_os = "macos"))]
    {
        1_000_000_000.0
    }
}

/// Convert a host tick count into nanoseconds.
pub fn host_time_to_ns(host_time: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        if host_time == 0 {
            return 0;
        }
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time
    }
}

/// Current host time in ticks.
pub fn host_time_now() -> u64 {
    #[cfg(target_os = "macos")]
    {
        unsafe { mach_absolute_time() }
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// Conversion between canonical frames and host ticks at a fixed rate.
#[derive(Clone, Copy, Debug)]
pub struct FrameClock {
    ticks_per_frame: f64,
}

impl FrameClock {
    /// Clock for `sample_rate` frames per second over `ticks_per_second` host ticks.
    pub fn new(sample_rate: u32, ticks_per_second: f64) -> Self {
        Self {
            ticks_per_frame: ticks_per_second / sample_rate as f64,
        }
    }

    /// Length of one frame in host ticks.
    pub fn ticks_per_frame(&self) -> f64 {
        self.ticks_per_frame
    }

    /// Duration of `frames` frames in host ticks, rounded to the nearest tick.
    pub fn frames_to_ticks(&self, frames: u64) -> u64 {
        (frames as f64 * self.ticks_per_frame).round() as u64
    }

    /// Signed frame distance from `from` to `to`.
    ///
    /// Distances under one sample period collapse to zero.
    pub fn frame_offset(&self, from: u64, to: u64) -> i64 {
        let ticks = to as i128 - from as i128;
        if (ticks.unsigned_abs() as f64) < self.ticks_per_frame {
            return 0;
        }
        (ticks as f64 / self.ticks_per_frame).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_offset_ignores_sub_sample_jitter() {
        let clock = FrameClock::new(48_000, 1_000_000_000.0);
        assert_eq!(clock.frame_offset(1_000, 1_010), 0);
        assert_eq!(clock.frame_offset(1_010, 1_000), 0);
    }

    #[test]
    fn frame_offset_is_signed() {
        let clock = FrameClock::new(48_000, 48_000.0);
        assert_eq!(clock.frame_offset(100, 164), 64);
        assert_eq!(clock.frame_offset(164, 100), -64);
        assert_eq!(clock.frames_to_ticks(64), 64);
    }

    #[test]
    fn host_time_is_monotonic() {
        let a = host_time_now();
        let b = host_time_now();
        assert!(b >= a);
        assert!(host_ticks_per_second() > 0.0);
    }
}
