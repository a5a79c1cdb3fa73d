//! Source identifiers and the per-source buffer abstraction.
//!
//! Push sources are backed by a [`TimestampedRing`]; pull sources by a
//! [`PullSource`] implementation. Both are reached through [`SourceBuffer`],
//! which reports available canonical frames and the next timestamp in the
//! same way regardless of mode.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use crate::convert::convert_into;
use crate::format::{AudioFormat, SampleBufferMut, SampleVec};
use crate::ring::TimestampedRing;

/// Caller-chosen identifier of a logical source. Never zero.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(NonZeroU64);

impl SourceId {
    /// Wrap a raw identifier, rejecting zero.
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Raw identifier value.
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for SourceId {
    fn from(id: NonZeroU64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Audio supplied on demand from the render thread.
///
/// Both methods are only ever called from [`Renderer`](crate::Renderer)
/// methods, never from control-side calls.
pub trait PullSource: Send + 'static {
    /// Produce `frames` frames in the source's declared format.
    ///
    /// `audio` is `None` when the mixer discards the frames; the source must
    /// still advance its position.
    fn render(&mut self, frames: usize, audio: Option<SampleBufferMut<'_>>);

    /// Frames currently available and the host time of the next one.
    fn peek(&mut self) -> (usize, u64);
}

/// [`PullSource`] built from a render closure and a peek closure.
pub struct PullFn<R, P> {
    render: R,
    peek: P,
}

/// Pair a render closure with a peek closure.
pub fn pull_fn<R, P>(render: R, peek: P) -> PullFn<R, P>
where
    R: FnMut(usize, Option<SampleBufferMut<'_>>) + Send + 'static,
    P: FnMut() -> (usize, u64) + Send + 'static,
{
    PullFn { render, peek }
}

impl<R, P> PullSource for PullFn<R, P>
where
    R: FnMut(usize, Option<SampleBufferMut<'_>>) + Send + 'static,
    P: FnMut() -> (usize, u64) + Send + 'static,
{
    fn render(&mut self, frames: usize, audio: Option<SampleBufferMut<'_>>) {
        (self.render)(frames, audio)
    }

    fn peek(&mut self) -> (usize, u64) {
        (self.peek)()
    }
}

/// Render-side adapter converting a pull source to canonical frames.
pub(crate) struct PullAdapter {
    source: Box<dyn PullSource>,
    format: AudioFormat,
    canonical: AudioFormat,
    scratch: SampleVec,
}

impl PullAdapter {
    pub(crate) fn new(
        source: Box<dyn PullSource>,
        format: AudioFormat,
        canonical: AudioFormat,
        scratch: SampleVec,
    ) -> Self {
        Self {
            source,
            format,
            canonical,
            scratch,
        }
    }

    /// Scratch samples needed to render `max_frames` canonical frames of `format`.
    pub(crate) fn scratch_samples(
        format: &AudioFormat,
        canonical: &AudioFormat,
        max_frames: usize,
    ) -> usize {
        (canonical.frames_at_rate(max_frames, format.sample_rate) + 1) * format.channel_count()
    }

    /// Swap in a new format and matching scratch, returning the old scratch.
    pub(crate) fn retune(&mut self, format: AudioFormat, scratch: SampleVec) -> SampleVec {
        self.format = format;
        std::mem::replace(&mut self.scratch, scratch)
    }

    pub(crate) fn format(&self) -> AudioFormat {
        self.format
    }

    fn peek(&mut self) -> (usize, Option<u64>) {
        let (frames, timestamp) = self.source.peek();
        if frames == 0 {
            return (0, None);
        }
        let canonical_frames = self.format.frames_at_rate(frames, self.canonical.sample_rate);
        (canonical_frames, Some(timestamp))
    }

    fn read(&mut self, out: Option<&mut [f32]>, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        let channels = self.format.channel_count();
        let capacity_frames = self.scratch.len() / channels;
        let source_frames = self
            .canonical
            .frames_at_rate(frames, self.format.sample_rate)
            .clamp(1, capacity_frames.max(1));
        let Some(out) = out else {
            self.source.render(source_frames, None);
            return frames;
        };
        let samples = source_frames * channels;
        if samples > self.scratch.len() {
            return 0;
        }
        let mut audio = self.scratch.slice_mut(samples);
        audio.fill_silence();
        self.source.render(source_frames, Some(audio));
        let dst = &mut out[..frames * self.canonical.channel_count()];
        convert_into(&self.format, self.scratch.slice(samples), &self.canonical, dst)
    }
}

/// Uniform view over a source's buffered audio in canonical frames.
pub(crate) enum SourceBuffer {
    Push(Arc<TimestampedRing>),
    Pull(PullAdapter),
}

impl SourceBuffer {
    /// Available canonical frames and the timestamp of the next one, without consuming.
    pub(crate) fn peek(&mut self) -> (usize, Option<u64>) {
        match self {
            Self::Push(ring) => ring.peek(),
            Self::Pull(adapter) => adapter.peek(),
        }
    }

    /// Consume up to `frames` canonical frames into `out`, or discard them.
    pub(crate) fn read(&mut self, out: Option<&mut [f32]>, frames: usize) -> usize {
        match self {
            Self::Push(ring) => ring.read(out, frames),
            Self::Pull(adapter) => adapter.read(out, frames),
        }
    }

    pub(crate) fn buffered_frames(&self) -> Option<usize> {
        match self {
            Self::Push(ring) => Some(ring.available_read()),
            Self::Pull(_) => None,
        }
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        match self {
            Self::Push(ring) => ring.dropped_frames(),
            Self::Pull(_) => 0,
        }
    }
}
