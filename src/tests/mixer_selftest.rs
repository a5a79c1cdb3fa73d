use std::time::Duration;

use dasp_signal::{self as signal, Signal};

use crate::{AudioFormat, MixerBuffer, MixerConfig, SourceId};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_FRAMES: usize = 256;

fn config(channels: u16) -> MixerConfig {
    MixerConfig {
        host_ticks_per_second: SAMPLE_RATE as f64,
        sync_timeout: Duration::from_millis(20),
        ..MixerConfig::new(AudioFormat::f32(SAMPLE_RATE, channels))
    }
}

fn sine(frequency_hz: f64, frames: usize) -> Vec<f32> {
    signal::rate(SAMPLE_RATE as f64)
        .const_hz(frequency_hz)
        .sine()
        .take(frames)
        .map(|s| (s * 0.5) as f32)
        .collect()
}

#[test]
fn selftest_sine_through_mixer() {
    let (mixer, mut renderer) = MixerBuffer::new(config(1)).expect("mixer");
    let id = SourceId::new(7).expect("id");
    let input = sine(1_000.0, (SAMPLE_RATE / 10) as usize);

    let start = 10_000u64;
    let mut recorded = Vec::with_capacity(input.len());
    for (block, chunk) in input.chunks(BLOCK_FRAMES).enumerate() {
        let host_time = start + (block * BLOCK_FRAMES) as u64;
        mixer.enqueue(id, chunk, host_time).expect("enqueue");
        let out = renderer.dequeue_scratch(chunk.len());
        recorded.extend_from_slice(out);
    }

    assert_eq!(recorded.len(), input.len());
    let expected_rms = rms(&input);
    let actual_rms = rms(&recorded);
    assert!(
        (expected_rms - actual_rms).abs() < 1e-4,
        "RMS mismatch: expected {expected_rms}, got {actual_rms}"
    );
    let corr = correlation(&input, &recorded);
    assert!(corr > 0.999, "phase correlation too low: {corr}");
}

#[test]
fn selftest_late_source_lines_up_with_early_one() {
    let (mixer, mut renderer) = MixerBuffer::new(config(1)).expect("mixer");
    let early = SourceId::new(1).expect("id");
    let late = SourceId::new(2).expect("id");
    let tone = sine(440.0, 1_024);

    // The late source carries the same tone delayed by 100 frames.
    mixer.enqueue(early, tone.as_slice(), 5_000).expect("enqueue");
    mixer.enqueue(late, &tone[..924], 5_100).expect("enqueue");
    mixer.set_volume(late, -1.0);

    let mut mixed = vec![0.0f32; 1_024];
    assert_eq!(renderer.dequeue(Some(&mut mixed), 1_024), 1_024);

    assert_eq!(&mixed[..100], &tone[..100]);
    for (frame, sample) in mixed[100..].iter().enumerate() {
        let expected = tone[frame + 100] - tone[frame];
        assert!((sample - expected).abs() < 1e-6, "frame {frame}: {sample} vs {expected}");
    }
}

#[test]
fn selftest_scratch_output_is_bounded_by_slice() {
    let (mixer, mut renderer) = MixerBuffer::new(MixerConfig {
        max_frames_per_slice: 128,
        ..config(2)
    })
    .expect("mixer");
    let id = SourceId::new(3).expect("id");
    mixer.enqueue(id, vec![0.25f32; 1_024].as_slice(), 0).expect("enqueue");
    assert_eq!(renderer.dequeue_scratch(512).len(), 128 * 2);
}

fn rms(signal: &[f32]) -> f32 {
    let energy: f32 = signal.iter().map(|s| s * s).sum();
    (energy / signal.len() as f32).sqrt()
}

fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        energy_a += (*x as f64).powi(2);
        energy_b += (*y as f64).powi(2);
    }
    if energy_a == 0.0 || energy_b == 0.0 {
        0.0
    } else {
        (dot / (energy_a.sqrt() * energy_b.sqrt())) as f32
    }
}
