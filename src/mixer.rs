//! Control and render handles of the mixer buffer.
//!
//! [`MixerBuffer`] is the control handle: cloneable, callable from any
//! non-real-time thread, and allowed to block briefly. [`Renderer`] belongs
//! to the single render thread; its methods never lock, never wait on the
//! control side and do not allocate.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use dasp_frame::{Frame, Stereo};
use tracing::{debug, trace};

use crate::clock::FrameClock;
use crate::config::MixerConfig;
use crate::convert::convert;
use crate::error::MixerError;
use crate::format::{AudioFormat, SampleBuffer};
use crate::registry::{ActiveSet, Shared, Slot, SourceMode, SourceState};
use crate::source::{PullSource, SourceId};
use crate::sync::{align, earliest_timestamp};

/// Equal-power pan gains `(left, right)` for `pan` in `[-1, 1]`.
pub fn pan_gains(pan: f32) -> Stereo<f32> {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    [angle.cos(), angle.sin()]
}

/// Accumulate `src` scaled by volume and pan into `dst`.
///
/// `pan: None` applies volume alone. Mono ignores pan. With more than two
/// channels the pan gains apply to channels 0 and 1 and the remaining
/// channels take volume only.
fn mix_into(dst: &mut [f32], src: &[f32], channels: usize, volume: f32, pan: Option<f32>) {
    let Some(pan) = pan.filter(|_| channels > 1) else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += s * volume;
        }
        return;
    };
    match channels {
        2 => {
            let gains = pan_gains(pan).scale_amp(volume);
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let frame: Stereo<f32> = [s[0], s[1]];
                let mixed = frame.mul_amp(gains).add_amp([d[0], d[1]]);
                d.copy_from_slice(&mixed);
            }
        }
        _ => {
            let [left, right] = pan_gains(pan).scale_amp(volume);
            for (d, s) in dst.chunks_exact_mut(channels).zip(src.chunks_exact(channels)) {
                d[0] += s[0] * left;
                d[1] += s[1] * right;
                for c in 2..channels {
                    d[c] += s[c] * volume;
                }
            }
        }
    }
}

/// Result of [`Renderer::peek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peek {
    /// Frames every active source can supply at the current alignment.
    pub frames: usize,
    /// Host time of the next frame to be emitted, once known.
    pub next_timestamp: Option<u64>,
}

/// Per-source diagnostics from the render thread's snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SourceStatus {
    /// Source identifier.
    pub id: SourceId,
    /// Push or pull.
    pub mode: SourceMode,
    /// Activity state.
    pub state: SourceState,
    /// Linear gain.
    pub volume: f32,
    /// Pan position.
    pub pan: f32,
    /// Declared source format.
    pub format: AudioFormat,
    /// Canonical frames queued in the ring; `None` for pull sources.
    pub buffered_frames: Option<usize>,
    /// Frames lost to ring overflow.
    pub dropped_frames: u64,
    /// Consecutive render calls without data.
    pub idle_cycles: u32,
}

impl SourceStatus {
    fn from_slot(slot: &Slot) -> Self {
        Self {
            id: slot.shared.id(),
            mode: slot.shared.mode(),
            state: slot.shared.state(),
            volume: slot.shared.volume(),
            pan: slot.shared.pan(),
            format: slot.shared.format(),
            buffered_frames: slot.buffer.buffered_frames(),
            dropped_frames: slot.buffer.dropped_frames(),
            idle_cycles: slot.idle_cycles,
        }
    }
}

/// Aggregated renderer snapshot used by diagnostics.
#[derive(Clone, Debug)]
pub struct MixerStatus {
    /// Canonical output format.
    pub format: AudioFormat,
    /// Frames emitted since the clock was anchored.
    pub frames_emitted: u64,
    /// Host time of the next output frame, once anchored.
    pub next_timestamp: Option<u64>,
    /// Sources in the render snapshot.
    pub sources: Vec<SourceStatus>,
}

/// Control handle: feeds push sources, installs pull sources, edits settings.
#[derive(Clone)]
pub struct MixerBuffer {
    shared: Arc<Shared>,
}

impl MixerBuffer {
    /// Create a mixer and its render handle.
    pub fn new(config: MixerConfig) -> Result<(Self, Renderer), MixerError> {
        config.validate()?;
        let samples = config.max_frames_per_slice * config.format.channel_count();
        let (shared, active) = Shared::new(config);
        debug!(format = %shared.config.format, "mixer buffer created");
        let renderer = Renderer {
            shared: shared.clone(),
            active,
            anchor: None,
            position: 0,
            scratch: vec![0.0; samples],
            output: vec![0.0; samples],
        };
        Ok((Self { shared }, renderer))
    }

    /// Create a mixer with default settings for `format`.
    pub fn with_format(format: AudioFormat) -> Result<(Self, Renderer), MixerError> {
        Self::new(MixerConfig::new(format))
    }

    /// Canonical format.
    pub fn format(&self) -> AudioFormat {
        self.shared.config.format
    }

    /// Active configuration.
    pub fn config(&self) -> &MixerConfig {
        &self.shared.config
    }

    /// Push audio for `id`, whose first frame plays at `host_time`.
    ///
    /// Registers `id` as a push source on first use. The render thread
    /// attaches new sources at the start of its next call; frames enqueued
    /// meanwhile stay buffered. An empty `audio` registers and waits for
    /// that attachment. Returns canonical frames stored.
    pub fn enqueue<'a>(
        &self,
        id: SourceId,
        audio: impl Into<SampleBuffer<'a>>,
        host_time: u64,
    ) -> Result<usize, MixerError> {
        let audio = audio.into();
        let handle = self.shared.register_or_touch_push(id)?;
        if audio.is_empty() {
            self.shared.wait_attached(&handle.shared);
            return Ok(0);
        }
        let format = handle.shared.format();
        if audio.len() % format.channel_count() != 0 {
            return Err(MixerError::MisalignedBuffer {
                samples: audio.len(),
                channels: format.channels,
            });
        }
        let converted = convert(&format, audio, &self.shared.config.format);
        let written = handle.ring.lock().write(&converted, host_time);
        trace!(source = %id, frames = written, host_time, "enqueued");
        Ok(written)
    }

    /// Register `id` as a push source and wait until the render thread mixes it.
    ///
    /// Returns `false` when the render thread did not attach it within
    /// [`MixerConfig::sync_timeout`].
    pub fn register_source(&self, id: SourceId) -> Result<bool, MixerError> {
        let handle = self.shared.register_or_touch_push(id)?;
        Ok(self.shared.wait_attached(&handle.shared))
    }

    /// Make `id` a pull source served by `source`.
    ///
    /// Calling again for the same id replaces the callbacks; the previous
    /// ones are not invoked after this returns.
    pub fn set_source_callbacks(
        &self,
        id: SourceId,
        source: impl PullSource,
    ) -> Result<(), MixerError> {
        self.shared.register_pull(id, Box::new(source)).map(|_| ())
    }

    /// Declare the format `id` delivers in.
    pub fn set_audio_description(
        &self,
        id: SourceId,
        format: AudioFormat,
    ) -> Result<(), MixerError> {
        self.shared.set_format(id, format)
    }

    /// Format `id` delivers in.
    pub fn format_of(&self, id: SourceId) -> AudioFormat {
        self.shared.format_of(id)
    }

    /// Set the linear gain of `id`.
    pub fn set_volume(&self, id: SourceId, volume: f32) {
        self.shared.set_volume(id, volume);
    }

    /// Linear gain of `id`.
    pub fn volume_of(&self, id: SourceId) -> f32 {
        self.shared.volume_of(id)
    }

    /// Set the pan of `id`, clamped to `[-1, 1]`.
    pub fn set_pan(&self, id: SourceId, pan: f32) {
        self.shared.set_pan(id, pan);
    }

    /// Pan of `id`.
    pub fn pan_of(&self, id: SourceId) -> f32 {
        self.shared.pan_of(id)
    }

    /// Whether `id` is registered and not retired.
    pub fn contains(&self, id: SourceId) -> bool {
        self.shared.lookup(id).is_some()
    }

    /// Registered sources, excluding evicted ones.
    pub fn source_count(&self) -> usize {
        self.shared.source_count()
    }

    /// Stop mixing `id`.
    ///
    /// Blocks until the render thread has left any call in progress; after
    /// that the source's data is never read and its callbacks never run.
    /// Returns `false` when `id` was not registered.
    pub fn unregister_source(&self, id: SourceId) -> bool {
        self.shared.unregister(id)
    }
}

/// Render handle: produces synchronised audio on the real-time thread.
pub struct Renderer {
    shared: Arc<Shared>,
    active: ActiveSet,
    /// Host time of output frame zero.
    anchor: Option<u64>,
    /// Frames emitted since the anchor.
    position: u64,
    scratch: Vec<f32>,
    output: Vec<f32>,
}

impl Renderer {
    /// Canonical format.
    pub fn format(&self) -> AudioFormat {
        self.shared.config.format
    }

    fn channels(&self) -> usize {
        self.shared.config.format.channel_count()
    }

    fn cycle<R>(&mut self, body: impl FnOnce(&mut Self) -> R) -> R {
        self.shared.render_epoch.fetch_add(1, Ordering::SeqCst);
        self.active.apply_pending(self.position);
        let result = body(self);
        self.shared.render_epoch.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Mix `frames` frames of every active source into `out`.
    ///
    /// `out` is interleaved canonical audio; `None` consumes and discards.
    /// Returns the frames produced: `frames` (bounded by `out`'s length)
    /// whenever at least one source is registered, `0` otherwise.
    pub fn dequeue(&mut self, out: Option<&mut [f32]>, frames: usize) -> usize {
        self.cycle(|renderer| renderer.render(out, frames, None))
    }

    /// Like [`dequeue`](Self::dequeue), writing into mixer-owned storage.
    ///
    /// At most [`MixerConfig::max_frames_per_slice`] frames are produced.
    pub fn dequeue_scratch(&mut self, frames: usize) -> &[f32] {
        let channels = self.channels();
        let frames = frames.min(self.shared.config.max_frames_per_slice);
        let mut output = std::mem::take(&mut self.output);
        let produced = self.dequeue(Some(&mut output[..frames * channels]), frames);
        self.output = output;
        &self.output[..produced * channels]
    }

    /// Synchronised audio of one source, unmixed.
    ///
    /// Volume applies; pan does not. Each source keeps its own consumption
    /// cursor so every source can be drained in turn for the same window. Do
    /// not combine with [`dequeue`](Self::dequeue) on the same renderer.
    /// Returns `0` for an id that is not in the render set.
    pub fn dequeue_single_source(
        &mut self,
        id: SourceId,
        out: Option<&mut [f32]>,
        frames: usize,
    ) -> usize {
        self.cycle(|renderer| renderer.render(out, frames, Some(id)))
    }

    /// Frames available at the current alignment and the next output timestamp.
    ///
    /// Consumes nothing and leaves the clock untouched.
    pub fn peek(&mut self) -> Peek {
        self.cycle(|renderer| renderer.peek_inner())
    }

    /// Visit the render snapshot as of the last render call.
    pub fn for_each_active(&self, mut visit: impl FnMut(&SourceStatus)) {
        for slot in self.active.slots() {
            visit(&SourceStatus::from_slot(slot));
        }
    }

    /// Snapshot for diagnostics. Allocates; not for the render thread.
    pub fn status(&self) -> MixerStatus {
        let mut sources = Vec::with_capacity(self.active.slots().len());
        self.for_each_active(|status| sources.push(*status));
        MixerStatus {
            format: self.format(),
            frames_emitted: self.position,
            next_timestamp: self.clock_time(self.position),
            sources,
        }
    }

    fn clock(&self) -> FrameClock {
        self.shared.frame_clock
    }

    fn clock_time(&self, position: u64) -> Option<u64> {
        self.anchor
            .map(|anchor| anchor + self.clock().frames_to_ticks(position))
    }

    /// Host time at `position`, anchoring the clock on the earliest buffered frame if needed.
    fn window_start(&mut self, position: u64) -> Option<u64> {
        if let Some(start) = self.clock_time(position) {
            return Some(start);
        }
        let earliest = earliest_timestamp(self.active.slots_mut())?;
        let anchor = earliest.saturating_sub(self.clock().frames_to_ticks(position));
        debug!(anchor, "mixer clock anchored");
        self.anchor = Some(anchor);
        Some(earliest)
    }

    fn render(
        &mut self,
        mut out: Option<&mut [f32]>,
        frames: usize,
        target: Option<SourceId>,
    ) -> usize {
        let channels = self.channels();
        let frames = match out.as_deref() {
            Some(out) => frames.min(out.len() / channels),
            None => frames,
        };
        let only = match target {
            None if self.active.slots().is_empty() => {
                if let Some(out) = out {
                    out[..frames * channels].fill(0.0);
                }
                return 0;
            }
            None => None,
            Some(id) => match self.active.index_of(id) {
                Some(index) => Some(index),
                None => return 0,
            },
        };

        let slice = self.shared.config.max_frames_per_slice;
        let mut done = 0;
        while done < frames {
            let count = (frames - done).min(slice);
            let dst = out
                .as_deref_mut()
                .map(|out| &mut out[done * channels..(done + count) * channels]);
            self.render_slice(dst, count, only);
            done += count;
        }
        self.active.settle(self.shared.config.stale_cycles, only);
        frames
    }

    fn render_slice(&mut self, mut out: Option<&mut [f32]>, frames: usize, only: Option<usize>) {
        if let Some(out) = out.as_deref_mut() {
            out.fill(0.0);
        }
        let position = match only {
            Some(index) => self.active.slots()[index].position,
            None => self.position,
        };
        let Some(window) = self.window_start(position) else {
            return;
        };
        let clock = self.clock();
        let channels = self.channels();
        let scratch = &mut self.scratch;
        match only {
            Some(index) => {
                let slot = &mut self.active.slots_mut()[index];
                let mix = Mix {
                    window,
                    frames,
                    channels,
                    panned: false,
                };
                render_source(slot, &mix, out, scratch, &clock);
                slot.position += frames as u64;
                self.position = self.position.max(slot.position);
            }
            None => {
                self.position += frames as u64;
                let mix = Mix {
                    window,
                    frames,
                    channels,
                    panned: true,
                };
                for slot in self.active.slots_mut() {
                    render_source(slot, &mix, out.as_deref_mut(), scratch, &clock);
                    slot.position = self.position;
                }
            }
        }
    }

    fn peek_inner(&mut self) -> Peek {
        let clock = self.clock();
        let next_timestamp = match self.clock_time(self.position) {
            Some(start) => Some(start),
            None => earliest_timestamp(self.active.slots_mut()),
        };
        if self.active.slots().is_empty() {
            return Peek {
                frames: 0,
                next_timestamp,
            };
        }
        // Each source covers `pad..pad + frames` of the window. Reporting the
        // smallest end is only gap-free when some source starts at zero.
        let mut frames = usize::MAX;
        let mut starts_at_window = false;
        for slot in self.active.slots_mut() {
            let (available, timestamp) = slot.buffer.peek();
            let (pad, deliverable) = match (timestamp, next_timestamp) {
                _ if available == 0 => (0, 0),
                (Some(timestamp), Some(window)) => {
                    let alignment = align(&clock, window, timestamp, available, usize::MAX);
                    (alignment.pad, alignment.frames)
                }
                _ => (0, available),
            };
            starts_at_window |= pad == 0;
            frames = frames.min(pad + deliverable);
        }
        Peek {
            frames: if starts_at_window { frames } else { 0 },
            next_timestamp,
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shared.renderer_alive.store(false, Ordering::Release);
    }
}

/// One output window as seen by [`render_source`].
struct Mix {
    /// Host time of the window's first frame.
    window: u64,
    frames: usize,
    channels: usize,
    /// Apply the pan law; single-source output is volume only.
    panned: bool,
}

/// Read, align, scale and accumulate one source's contribution to a window.
fn render_source(
    slot: &mut Slot,
    mix: &Mix,
    out: Option<&mut [f32]>,
    scratch: &mut [f32],
    clock: &FrameClock,
) {
    let (available, timestamp) = slot.buffer.peek();
    if available == 0 {
        return;
    }
    slot.saw_data = true;
    let window = mix.window;
    let alignment = align(clock, window, timestamp.unwrap_or(window), available, mix.frames);
    if alignment.drop > 0 {
        slot.buffer.read(None, alignment.drop);
    }
    if alignment.frames == 0 {
        return;
    }
    let Some(out) = out else {
        slot.buffer.read(None, alignment.frames);
        return;
    };
    let channels = mix.channels;
    let samples = alignment.frames * channels;
    let read = slot.buffer.read(Some(&mut scratch[..samples]), alignment.frames);
    let start = alignment.pad * channels;
    let len = read * channels;
    let pan = mix.panned.then(|| slot.shared.pan());
    mix_into(
        &mut out[start..start + len],
        &scratch[..len],
        channels,
        slot.shared.volume(),
        pan,
    );
}
