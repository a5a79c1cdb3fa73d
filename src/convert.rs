//! Conversion of linear PCM into the canonical interleaved `f32` format.
//!
//! Channel mapping policy:
//! - equal channel counts copy channel for channel;
//! - a mono source feeds every output channel;
//! - a mono output receives the average of all source channels;
//! - otherwise output channel `c` takes source channel `c`, and output
//!   channels the source lacks stay silent.
//!
//! Sample rates are reconciled by linear interpolation: output frame `i`
//! samples the input at `i * src_rate / dst_rate`, clamped to the last input
//! frame. Each call is independent of previous calls.

use std::borrow::Cow;

use dasp_sample::Sample;

use crate::format::{AudioFormat, SampleBuffer};

#[inline]
fn sample_at(input: &SampleBuffer<'_>, index: usize) -> f32 {
    match input {
        SampleBuffer::F32(s) => s[index],
        SampleBuffer::I16(s) => s[index].to_sample::<f32>(),
        SampleBuffer::I32(s) => s[index].to_sample::<f32>(),
    }
}

#[inline]
fn mapped_sample(
    input: &SampleBuffer<'_>,
    frame: usize,
    channel: usize,
    in_channels: usize,
    out_channels: usize,
) -> f32 {
    let base = frame * in_channels;
    if in_channels == out_channels {
        sample_at(input, base + channel)
    } else if in_channels == 1 {
        sample_at(input, base)
    } else if out_channels == 1 {
        let sum: f32 = (0..in_channels).map(|c| sample_at(input, base + c)).sum();
        sum / in_channels as f32
    } else if channel < in_channels {
        sample_at(input, base + channel)
    } else {
        0.0
    }
}

/// Frames `convert` produces for `in_frames` frames of `src`.
pub fn converted_frames(src: &AudioFormat, in_frames: usize, dst: &AudioFormat) -> usize {
    src.frames_at_rate(in_frames, dst.sample_rate)
}

/// Convert `input` (interleaved, `src` layout) into `out` (interleaved, `dst` layout).
///
/// With matching rates at most `min(input frames, out frames)` frames are
/// written. With differing rates `out` is filled completely, stretching or
/// compressing the input across it. Returns the frames written.
pub fn convert_into(
    src: &AudioFormat,
    input: SampleBuffer<'_>,
    dst: &AudioFormat,
    out: &mut [f32],
) -> usize {
    let in_channels = src.channel_count();
    let out_channels = dst.channel_count();
    if in_channels == 0 || out_channels == 0 {
        return 0;
    }
    let in_frames = input.len() / in_channels;
    let mut out_frames = out.len() / out_channels;
    if in_frames == 0 || out_frames == 0 {
        return 0;
    }

    if src.sample_rate == dst.sample_rate {
        out_frames = out_frames.min(in_frames);
        for (frame, chunk) in out
            .chunks_exact_mut(out_channels)
            .take(out_frames)
            .enumerate()
        {
            for (channel, dst_sample) in chunk.iter_mut().enumerate() {
                *dst_sample = mapped_sample(&input, frame, channel, in_channels, out_channels);
            }
        }
        return out_frames;
    }

    let step = src.sample_rate as f64 / dst.sample_rate as f64;
    let last = in_frames - 1;
    for (frame, chunk) in out
        .chunks_exact_mut(out_channels)
        .take(out_frames)
        .enumerate()
    {
        let position = frame as f64 * step;
        let index = (position.floor() as usize).min(last);
        let next = (index + 1).min(last);
        let t = if index == last {
            0.0
        } else {
            (position - index as f64) as f32
        };
        for (channel, dst_sample) in chunk.iter_mut().enumerate() {
            let a = mapped_sample(&input, index, channel, in_channels, out_channels);
            let b = mapped_sample(&input, next, channel, in_channels, out_channels);
            *dst_sample = a + (b - a) * t;
        }
    }
    out_frames
}

/// Convert `input` into the canonical layout `dst`.
///
/// The representation is taken from `input`; `src.sample_format` is not
/// consulted. Matching `f32` input is borrowed without copying.
pub fn convert<'a>(
    src: &AudioFormat,
    input: SampleBuffer<'a>,
    dst: &AudioFormat,
) -> Cow<'a, [f32]> {
    let in_channels = src.channel_count().max(1);
    let in_frames = input.len() / in_channels;
    if let SampleBuffer::F32(samples) = input {
        if src.sample_rate == dst.sample_rate && src.channels == dst.channels {
            return Cow::Borrowed(&samples[..in_frames * in_channels]);
        }
    }
    let frames = converted_frames(src, in_frames, dst);
    let mut out = vec![0.0f32; frames * dst.channel_count()];
    let written = convert_into(src, input, dst, &mut out);
    out.truncate(written * dst.channel_count());
    Cow::Owned(out)
}
