//! Timestamp alignment of a source against the output window.
//!
//! A source whose next frame is due after the window start is padded with
//! silence; one whose next frame is due before it has the late frames
//! dropped. Offsets under one sample period count as aligned.

use crate::clock::FrameClock;
use crate::registry::Slot;

/// How a source's buffered frames land in a window of output frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Alignment {
    /// Leading silent frames before the source's first frame.
    pub(crate) pad: usize,
    /// Late frames to discard before reading.
    pub(crate) drop: usize,
    /// Frames to read and mix after padding.
    pub(crate) frames: usize,
}

/// Align `available` frames starting at `timestamp` against a window of
/// `frames` frames starting at `window`.
pub(crate) fn align(
    clock: &FrameClock,
    window: u64,
    timestamp: u64,
    available: usize,
    frames: usize,
) -> Alignment {
    let offset = clock.frame_offset(window, timestamp);
    if offset >= 0 {
        let pad = (offset as u64).min(frames as u64) as usize;
        Alignment {
            pad,
            drop: 0,
            frames: available.min(frames - pad),
        }
    } else {
        let drop = offset.unsigned_abs().min(available as u64) as usize;
        Alignment {
            pad: 0,
            drop,
            frames: (available - drop).min(frames),
        }
    }
}

/// Earliest next-frame timestamp among sources holding data.
pub(crate) fn earliest_timestamp(slots: &mut [Box<Slot>]) -> Option<u64> {
    slots
        .iter_mut()
        .filter_map(|slot| match slot.buffer.peek() {
            (0, _) => None,
            (_, timestamp) => timestamp,
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> FrameClock {
        FrameClock::new(48_000, 48_000.0)
    }

    #[test]
    fn late_source_is_padded() {
        let a = align(&clock(), 1_000, 1_064, 512, 256);
        assert_eq!(a, Alignment { pad: 64, drop: 0, frames: 192 });
    }

    #[test]
    fn padding_is_capped_by_window() {
        let a = align(&clock(), 1_000, 5_000, 512, 256);
        assert_eq!(a, Alignment { pad: 256, drop: 0, frames: 0 });
    }

    #[test]
    fn early_source_is_trimmed() {
        let a = align(&clock(), 1_064, 1_000, 512, 256);
        assert_eq!(a, Alignment { pad: 0, drop: 64, frames: 256 });
    }

    #[test]
    fn trimming_is_capped_by_available() {
        let a = align(&clock(), 10_000, 1_000, 100, 256);
        assert_eq!(a, Alignment { pad: 0, drop: 100, frames: 0 });
    }

    #[test]
    fn sub_sample_offset_counts_as_aligned() {
        let clock = FrameClock::new(48_000, 1_000_000_000.0);
        let a = align(&clock, 1_000_000, 1_000_010, 128, 128);
        assert_eq!(a, Alignment { pad: 0, drop: 0, frames: 128 });
    }
}
