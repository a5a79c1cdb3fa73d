//! Single-producer/single-consumer ring buffer of timestamped audio frames.
//!
//! Samples are interleaved canonical `f32` values stored as `AtomicU32` bit
//! patterns so that a producer evicting old frames can never race the
//! consumer into undefined behaviour. Each write records a span (first frame
//! index plus host time) whenever its timestamp does not continue the
//! previous write, letting the consumer derive the timestamp of any buffered
//! frame.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use crate::clock::FrameClock;

/// Span records retained for timestamp lookup.
pub const SPAN_CAPACITY: usize = 128;

/// Consumer retries after losing a race with producer eviction.
const MAX_READ_ATTEMPTS: usize = 4;

struct SpanSlot {
    /// `index + 1` once published, `0` while being rewritten.
    seq: AtomicU64,
    start_frame: AtomicU64,
    host_time: AtomicU64,
}

impl SpanSlot {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            start_frame: AtomicU64::new(0),
            host_time: AtomicU64::new(0),
        }
    }
}

/// Lock-free ring buffer for interleaved `f32` audio tagged with host times.
///
/// `write` must only ever be called from one thread at a time; callers
/// serialise producers themselves. `peek`, `read` and `discard` belong to
/// the single consumer.
pub struct TimestampedRing {
    data: Box<[AtomicU32]>,
    spans: Box<[SpanSlot]>,
    capacity_frames: usize,
    channels: usize,
    clock: FrameClock,
    write_index: AtomicU64,
    read_index: AtomicU64,
    span_write: AtomicU64,
    /// Host time at which the next contiguous write would start.
    expected_next: AtomicU64,
    dropped_frames: AtomicU64,
}

impl TimestampedRing {
    /// Allocate a ring holding `capacity_frames` frames of `channels` channels.
    ///
    /// Returns `None` when the storage cannot be reserved.
    pub fn try_new(capacity_frames: usize, channels: usize, clock: FrameClock) -> Option<Self> {
        if capacity_frames == 0 || channels == 0 {
            return None;
        }
        let samples = capacity_frames.checked_mul(channels)?;
        let mut data = Vec::new();
        data.try_reserve_exact(samples).ok()?;
        data.extend((0..samples).map(|_| AtomicU32::new(0)));
        let mut spans = Vec::new();
        spans.try_reserve_exact(SPAN_CAPACITY).ok()?;
        spans.extend((0..SPAN_CAPACITY).map(|_| SpanSlot::new()));
        Some(Self {
            data: data.into_boxed_slice(),
            spans: spans.into_boxed_slice(),
            capacity_frames,
            channels,
            clock,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            span_write: AtomicU64::new(0),
            expected_next: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        })
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Channel count of stored frames.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames evicted by overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Append interleaved frames whose first frame plays at `host_time`.
    ///
    /// Oldest frames are evicted when the ring lacks room. A write larger
    /// than the ring keeps only its newest `capacity_frames` frames. Returns
    /// the number of frames stored.
    pub fn write(&self, frames: &[f32], host_time: u64) -> usize {
        let mut frames_count = frames.len() / self.channels;
        if frames_count == 0 {
            return 0;
        }
        let mut frames = &frames[..frames_count * self.channels];
        let mut host_time = host_time;
        if frames_count > self.capacity_frames {
            let skip = frames_count - self.capacity_frames;
            frames = &frames[skip * self.channels..];
            host_time += self.clock.frames_to_ticks(skip as u64);
            self.dropped_frames.fetch_add(skip as u64, Ordering::Relaxed);
            frames_count = self.capacity_frames;
        }

        let write_index = self.write_index.load(Ordering::Relaxed);
        let needed =
            (write_index + frames_count as u64).saturating_sub(self.capacity_frames as u64);
        let mut read_index = self.read_index.load(Ordering::Acquire);
        while read_index < needed {
            match self.read_index.compare_exchange_weak(
                read_index,
                needed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.dropped_frames
                        .fetch_add(needed - read_index, Ordering::Relaxed);
                    break;
                }
                Err(current) => read_index = current,
            }
        }

        let ring_samples = self.data.len();
        let start = (write_index % self.capacity_frames as u64) as usize * self.channels;
        for (offset, sample) in frames.iter().enumerate() {
            let pos = (start + offset) % ring_samples;
            self.data[pos].store(sample.to_bits(), Ordering::Relaxed);
        }

        self.record_span(write_index, host_time);
        self.write_index
            .store(write_index + frames_count as u64, Ordering::Release);
        self.expected_next.store(
            host_time + self.clock.frames_to_ticks(frames_count as u64),
            Ordering::Relaxed,
        );
        frames_count
    }

    fn record_span(&self, start_frame: u64, host_time: u64) {
        let span_index = self.span_write.load(Ordering::Relaxed);
        if span_index > 0 {
            let expected = self.expected_next.load(Ordering::Relaxed);
            let drift = (host_time as i128 - expected as i128).unsigned_abs() as f64;
            if drift < self.clock.ticks_per_frame() {
                return;
            }
        }
        let slot = &self.spans[span_index as usize % SPAN_CAPACITY];
        slot.seq.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.start_frame.store(start_frame, Ordering::Relaxed);
        slot.host_time.store(host_time, Ordering::Relaxed);
        slot.seq.store(span_index + 1, Ordering::Release);
        self.span_write.store(span_index + 1, Ordering::Release);
    }

    /// Host time of the frame at absolute index `frame`.
    fn timestamp_of(&self, frame: u64) -> Option<u64> {
        let end = self.span_write.load(Ordering::Acquire);
        let begin = end.saturating_sub(SPAN_CAPACITY as u64);
        let mut oldest = None;
        for index in (begin..end).rev() {
            let slot = &self.spans[index as usize % SPAN_CAPACITY];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq != index + 1 {
                continue;
            }
            let start = slot.start_frame.load(Ordering::Relaxed);
            let host_time = slot.host_time.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != seq {
                continue;
            }
            if start <= frame {
                return Some(host_time + self.clock.frames_to_ticks(frame - start));
            }
            oldest = Some((start, host_time));
        }
        // Span history overrun: extrapolate backwards from the oldest survivor.
        oldest.map(|(start, host_time)| {
            host_time.saturating_sub(self.clock.frames_to_ticks(start - frame))
        })
    }

    /// Frames ready for reading.
    pub fn available_read(&self) -> usize {
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        write_index
            .saturating_sub(read_index)
            .min(self.capacity_frames as u64) as usize
    }

    /// Available frames and the host time of the next unread frame, without consuming.
    pub fn peek(&self) -> (usize, Option<u64>) {
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        let available = write_index
            .saturating_sub(read_index)
            .min(self.capacity_frames as u64) as usize;
        if available == 0 {
            return (0, None);
        }
        (available, self.timestamp_of(read_index))
    }

    /// Consume up to `frames` frames into `out`, or drop them when `out` is `None`.
    ///
    /// Returns the frames consumed. Never pads.
    pub fn read(&self, mut out: Option<&mut [f32]>, frames: usize) -> usize {
        let ring_samples = self.data.len();
        for _ in 0..MAX_READ_ATTEMPTS {
            let read_index = self.read_index.load(Ordering::Acquire);
            let write_index = self.write_index.load(Ordering::Acquire);
            let available = write_index.saturating_sub(read_index) as usize;
            let count = frames.min(available).min(self.capacity_frames);
            if count == 0 {
                return 0;
            }
            if let Some(out) = out.as_deref_mut() {
                let samples = count * self.channels;
                let start = (read_index % self.capacity_frames as u64) as usize * self.channels;
                for (offset, dst) in out[..samples].iter_mut().enumerate() {
                    let pos = (start + offset) % ring_samples;
                    *dst = f32::from_bits(self.data[pos].load(Ordering::Relaxed));
                }
            }
            if self
                .read_index
                .compare_exchange(
                    read_index,
                    read_index + count as u64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return count;
            }
        }
        0
    }

    /// Drop frames without copying, returning the number discarded.
    pub fn discard(&self, frames: usize) -> usize {
        self.read(None, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize, channels: usize) -> TimestampedRing {
        TimestampedRing::try_new(capacity, channels, FrameClock::new(48_000, 48_000.0))
            .expect("ring")
    }

    #[test]
    fn peek_reports_timestamp_of_read_position() {
        let ring = ring(64, 1);
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert_eq!(ring.write(&input, 1_000), 16);
        assert_eq!(ring.peek(), (16, Some(1_000)));

        let mut out = [0.0f32; 4];
        assert_eq!(ring.read(Some(&mut out), 4), 4);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(ring.peek(), (12, Some(1_004)));
    }

    #[test]
    fn contiguous_writes_share_a_span_and_gaps_start_new_ones() {
        let ring = ring(64, 1);
        ring.write(&[0.5; 8], 100);
        ring.write(&[0.5; 8], 108);
        ring.write(&[0.5; 8], 200);
        assert_eq!(ring.span_write.load(Ordering::Relaxed), 2);

        ring.discard(16);
        assert_eq!(ring.peek(), (8, Some(200)));
    }

    #[test]
    fn overflow_evicts_oldest_frames() {
        let ring = ring(8, 2);
        let first: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let second: Vec<f32> = (12..24).map(|i| i as f32).collect();
        ring.write(&first, 0);
        ring.write(&second, 6);
        assert_eq!(ring.available_read(), 8);
        assert_eq!(ring.dropped_frames(), 4);

        let mut out = [0.0f32; 16];
        assert_eq!(ring.read(Some(&mut out), 8), 8);
        let expected: Vec<f32> = (8..24).map(|i| i as f32).collect();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn oversized_write_keeps_newest_frames() {
        let ring = ring(4, 1);
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(ring.write(&input, 0), 4);
        assert_eq!(ring.peek(), (4, Some(6)));
        let mut out = [0.0f32; 4];
        ring.read(Some(&mut out), 4);
        assert_eq!(out, [6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn read_returns_short_without_padding() {
        let ring = ring(16, 1);
        ring.write(&[0.25; 3], 0);
        let mut out = [9.0f32; 8];
        assert_eq!(ring.read(Some(&mut out), 8), 3);
        assert_eq!(&out[3..], &[9.0; 5]);
        assert_eq!(ring.peek(), (0, None));
    }

    #[test]
    fn concurrent_producer_never_corrupts_consumer() {
        use std::sync::Arc;

        let ring = Arc::new(ring(256, 1));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut t = 0u64;
                for _ in 0..2_000 {
                    let block: Vec<f32> = (0..32).map(|i| (t + i) as f32).collect();
                    ring.write(&block, t);
                    t += 32;
                }
            })
        };
        let mut out = [0.0f32; 64];
        let mut last = -1.0f32;
        for _ in 0..4_000 {
            let read = ring.read(Some(&mut out), 64);
            for &sample in &out[..read] {
                assert!(sample > last, "sample {sample} after {last}");
                last = sample;
            }
        }
        producer.join().unwrap();
    }
}
