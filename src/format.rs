//! Audio format descriptors and borrowed sample views.

use std::fmt;

/// Highest channel count accepted for any format.
pub const MAX_CHANNELS: u16 = 8;

/// Sample representation of linear PCM data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleFormat {
    /// 32-bit float in `[-1, 1]`.
    F32 = 0,
    /// Signed 16-bit integer.
    I16 = 1,
    /// Signed 32-bit integer.
    I32 = 2,
}

impl SampleFormat {
    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::F32),
            1 => Some(Self::I16),
            2 => Some(Self::I32),
            _ => None,
        }
    }
}

/// Describes interleaved linear PCM: rate, channel count and sample type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample representation.
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// Interleaved `f32` format, the only representation the mixer outputs.
    pub const fn f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::F32,
        }
    }

    /// Interleaved signed 16-bit format.
    pub const fn i16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::I16,
        }
    }

    /// Interleaved signed 32-bit format.
    pub const fn i32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::I32,
        }
    }

    /// Whether the descriptor can be converted from or to.
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && self.channels <= MAX_CHANNELS
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels as usize
    }

    /// Number of frames in `other`'s rate covering `frames` frames of this format.
    pub(crate) fn frames_at_rate(&self, frames: usize, other_rate: u32) -> usize {
        if self.sample_rate == other_rate {
            return frames;
        }
        ((frames as u64 * other_rate as u64 + self.sample_rate as u64 / 2)
            / self.sample_rate as u64) as usize
    }

    pub(crate) fn to_bits(self) -> u64 {
        (self.sample_rate as u64) << 32 | (self.channels as u64) << 8 | self.sample_format as u64
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        Self {
            sample_rate: (bits >> 32) as u32,
            channels: ((bits >> 8) & 0xffff) as u16,
            sample_format: SampleFormat::from_bits(bits as u8).unwrap_or(SampleFormat::F32),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz / {} ch / {:?}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

/// Borrowed interleaved samples in any supported representation.
#[derive(Clone, Copy, Debug)]
pub enum SampleBuffer<'a> {
    /// Float samples.
    F32(&'a [f32]),
    /// 16-bit samples.
    I16(&'a [i16]),
    /// 32-bit samples.
    I32(&'a [i32]),
}

impl SampleBuffer<'_> {
    /// Total interleaved sample count.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::I16(s) => s.len(),
            Self::I32(s) => s.len(),
        }
    }

    /// True when no samples are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Representation of the borrowed data.
    pub fn sample_format(&self) -> SampleFormat {
        match self {
            Self::F32(_) => SampleFormat::F32,
            Self::I16(_) => SampleFormat::I16,
            Self::I32(_) => SampleFormat::I32,
        }
    }
}

impl<'a> From<&'a [f32]> for SampleBuffer<'a> {
    fn from(samples: &'a [f32]) -> Self {
        Self::F32(samples)
    }
}

impl<'a> From<&'a [i16]> for SampleBuffer<'a> {
    fn from(samples: &'a [i16]) -> Self {
        Self::I16(samples)
    }
}

impl<'a> From<&'a [i32]> for SampleBuffer<'a> {
    fn from(samples: &'a [i32]) -> Self {
        Self::I32(samples)
    }
}

/// Mutable interleaved samples handed to pull sources.
#[derive(Debug)]
pub enum SampleBufferMut<'a> {
    /// Float samples.
    F32(&'a mut [f32]),
    /// 16-bit samples.
    I16(&'a mut [i16]),
    /// 32-bit samples.
    I32(&'a mut [i32]),
}

impl SampleBufferMut<'_> {
    /// Total interleaved sample count.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::I16(s) => s.len(),
            Self::I32(s) => s.len(),
        }
    }

    /// True when no samples are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero every sample.
    pub fn fill_silence(&mut self) {
        match self {
            Self::F32(s) => s.fill(0.0),
            Self::I16(s) => s.fill(0),
            Self::I32(s) => s.fill(0),
        }
    }
}

/// Owned sample storage matching a [`SampleFormat`]; the pull adapter renders into it.
#[derive(Debug)]
pub(crate) enum SampleVec {
    F32(Vec<f32>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl SampleVec {
    /// Reserve `samples` zeroed entries without aborting on allocation failure.
    pub(crate) fn try_zeroed(format: SampleFormat, samples: usize) -> Option<Self> {
        fn zeroed<T: Copy + Default>(samples: usize) -> Option<Vec<T>> {
            let mut v = Vec::new();
            v.try_reserve_exact(samples).ok()?;
            v.resize(samples, T::default());
            Some(v)
        }
        Some(match format {
            SampleFormat::F32 => Self::F32(zeroed(samples)?),
            SampleFormat::I16 => Self::I16(zeroed(samples)?),
            SampleFormat::I32 => Self::I32(zeroed(samples)?),
        })
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    pub(crate) fn slice_mut(&mut self, samples: usize) -> SampleBufferMut<'_> {
        match self {
            Self::F32(v) => SampleBufferMut::F32(&mut v[..samples]),
            Self::I16(v) => SampleBufferMut::I16(&mut v[..samples]),
            Self::I32(v) => SampleBufferMut::I32(&mut v[..samples]),
        }
    }

    pub(crate) fn slice(&self, samples: usize) -> SampleBuffer<'_> {
        match self {
            Self::F32(v) => SampleBuffer::F32(&v[..samples]),
            Self::I16(v) => SampleBuffer::I16(&v[..samples]),
            Self::I32(v) => SampleBuffer::I32(&v[..samples]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bits_survive_packing() {
        for format in [
            AudioFormat::f32(48_000, 2),
            AudioFormat::i16(44_100, 1),
            AudioFormat::i32(192_000, 8),
        ] {
            assert_eq!(AudioFormat::from_bits(format.to_bits()), format);
        }
    }

    #[test]
    fn frames_at_rate_rounds_to_nearest() {
        let format = AudioFormat::f32(48_000, 2);
        assert_eq!(format.frames_at_rate(480, 44_100), 441);
        assert_eq!(format.frames_at_rate(1, 24_000), 1);
        assert_eq!(format.frames_at_rate(256, 48_000), 256);
    }

    #[test]
    fn validity_checks_channel_bounds() {
        assert!(AudioFormat::f32(48_000, 2).is_valid());
        assert!(!AudioFormat::f32(48_000, 0).is_valid());
        assert!(!AudioFormat::f32(48_000, MAX_CHANNELS + 1).is_valid());
        assert!(!AudioFormat::f32(0, 2).is_valid());
    }
}
