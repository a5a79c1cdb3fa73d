use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mixbuf::{
    AudioFormat, MixerBuffer, MixerConfig, MixerError, PullSource, Renderer, SampleBufferMut,
    SourceId, SourceMode, pull_fn,
};

const SAMPLE_RATE: u32 = 48_000;

fn config() -> MixerConfig {
    MixerConfig {
        host_ticks_per_second: SAMPLE_RATE as f64,
        sync_timeout: Duration::from_millis(20),
        stale_cycles: 4,
        ..MixerConfig::new(AudioFormat::f32(SAMPLE_RATE, 1))
    }
}

fn id(raw: u64) -> SourceId {
    SourceId::new(raw).expect("non-zero id")
}

fn active_ids(renderer: &Renderer) -> Vec<SourceId> {
    let mut ids = Vec::new();
    renderer.for_each_active(|status| ids.push(status.id));
    ids
}

/// Pull source emitting a constant on a timeline of one tick per frame.
struct Constant {
    value: f32,
    next: u64,
    calls: Arc<AtomicUsize>,
}

impl Constant {
    fn new(value: f32, start: u64) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Self {
            value,
            next: start,
            calls: calls.clone(),
        };
        (source, calls)
    }
}

impl PullSource for Constant {
    fn render(&mut self, frames: usize, audio: Option<SampleBufferMut<'_>>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(SampleBufferMut::F32(samples)) = audio {
            samples.fill(self.value);
        }
        self.next += frames as u64;
    }

    fn peek(&mut self) -> (usize, u64) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (4_096, self.next)
    }
}

#[test]
fn idle_push_source_is_evicted() {
    let (mixer, mut renderer) = MixerBuffer::new(config()).expect("mixer");
    let source = id(1);
    mixer.enqueue(source, vec![0.5f32; 64].as_slice(), 0).expect("enqueue");

    let mut out = vec![0.0f32; 64];
    renderer.dequeue(Some(&mut out), 64);
    for _ in 0..4 {
        renderer.dequeue(Some(&mut out), 64);
    }
    assert_eq!(active_ids(&renderer), vec![source]);

    renderer.dequeue(Some(&mut out), 64);
    assert!(active_ids(&renderer).is_empty());
    assert!(!mixer.contains(source));
    assert_eq!(mixer.source_count(), 0);

    // The identifier can register again; the clock is at 6 * 64 frames.
    mixer.enqueue(source, vec![0.5f32; 64].as_slice(), 384).expect("enqueue");
    renderer.dequeue(Some(&mut out), 64);
    assert_eq!(active_ids(&renderer), vec![source]);
    assert!(out.iter().all(|s| *s == 0.5));
}

#[test]
fn starved_pull_source_is_evicted() {
    let (mixer, mut renderer) = MixerBuffer::new(config()).expect("mixer");
    let source = id(7);
    let renders = Arc::new(AtomicUsize::new(0));
    let counter = renders.clone();
    mixer
        .set_source_callbacks(
            source,
            pull_fn(
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                || (0, 0),
            ),
        )
        .expect("callbacks");

    let mut out = vec![0.0f32; 64];
    for _ in 0..4 {
        assert_eq!(renderer.dequeue(Some(&mut out), 64), 64);
    }
    assert_eq!(active_ids(&renderer), vec![source]);
    assert_eq!(renderer.status().sources[0].idle_cycles, 4);

    renderer.dequeue(Some(&mut out), 64);
    assert!(active_ids(&renderer).is_empty());
    assert!(!mixer.contains(source));
    assert_eq!(mixer.source_count(), 0);
    assert_eq!(renders.load(Ordering::SeqCst), 0);
}

/// Pull source answering in whichever sample format it is handed.
struct AnyFormat {
    next: u64,
}

impl PullSource for AnyFormat {
    fn render(&mut self, frames: usize, audio: Option<SampleBufferMut<'_>>) {
        match audio {
            Some(SampleBufferMut::F32(samples)) => samples.fill(0.25),
            Some(SampleBufferMut::I16(samples)) => samples.fill(16_384),
            _ => {}
        }
        self.next += frames as u64;
    }

    fn peek(&mut self) -> (usize, u64) {
        (4_096, self.next)
    }
}

#[test]
fn format_change_reaches_attached_pull_source() {
    let (mixer, mut renderer) = MixerBuffer::new(config()).expect("mixer");
    let source = id(8);
    mixer
        .set_source_callbacks(source, AnyFormat { next: 0 })
        .expect("callbacks");

    let mut out = vec![0.0f32; 64];
    renderer.dequeue(Some(&mut out), 64);
    assert_eq!(active_ids(&renderer), vec![source]);
    assert!(out.iter().all(|s| *s == 0.25));

    let i16_mono = AudioFormat::i16(SAMPLE_RATE, 1);
    mixer.set_audio_description(source, i16_mono).expect("format");
    assert_eq!(mixer.format_of(source), i16_mono);
    renderer.dequeue(Some(&mut out), 64);
    assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-5), "{out:?}");
    assert_eq!(renderer.status().sources[0].format, i16_mono);
}

/// Pull source that records which thread drops it.
struct DropWitness {
    drops: Arc<Mutex<Vec<ThreadId>>>,
}

impl PullSource for DropWitness {
    fn render(&mut self, _frames: usize, _audio: Option<SampleBufferMut<'_>>) {}

    fn peek(&mut self) -> (usize, u64) {
        (0, 0)
    }
}

impl Drop for DropWitness {
    fn drop(&mut self) {
        self.drops.lock().expect("drops").push(thread::current().id());
    }
}

#[test]
fn released_sources_are_freed_off_the_render_thread() {
    let (mixer, mut renderer) = MixerBuffer::new(MixerConfig {
        max_sources: 2,
        command_capacity: 8,
        ..config()
    })
    .expect("mixer");
    let drops = Arc::new(Mutex::new(Vec::new()));
    let witness = || DropWitness {
        drops: drops.clone(),
    };

    // Eight attach commands, six of them for callbacks already replaced.
    for source in [1, 2, 1, 1, 1, 2, 2, 2] {
        mixer
            .set_source_callbacks(id(source), witness())
            .expect("callbacks");
    }
    assert!(drops.lock().expect("drops").is_empty());

    let render_thread = thread::spawn(move || {
        let mut out = vec![0.0f32; 64];
        renderer.dequeue(Some(&mut out), 64);
        (thread::current().id(), renderer)
    })
    .join()
    .expect("render thread");
    let (render_id, renderer) = render_thread;
    assert_eq!(active_ids(&renderer).len(), 2);

    assert_eq!(mixer.source_count(), 2);
    let drops = drops.lock().expect("drops").clone();
    assert_eq!(drops.len(), 6);
    assert!(drops.iter().all(|thread| *thread != render_id));
}

#[test]
fn overflow_keeps_newest_frames() {
    let (mixer, mut renderer) = MixerBuffer::new(MixerConfig {
        ring_capacity_frames: 64,
        ..config()
    })
    .expect("mixer");
    let source = id(2);
    let ramp: Vec<f32> = (0..120).map(|i| i as f32).collect();
    assert_eq!(mixer.enqueue(source, &ramp[..100], 1_000).expect("enqueue"), 64);
    mixer.enqueue(source, &ramp[100..], 1_100).expect("enqueue");

    let mut out = vec![0.0f32; 64];
    assert_eq!(renderer.dequeue_single_source(source, Some(&mut out), 64), 64);
    assert_eq!(out, &ramp[56..]);

    let status = renderer.status();
    assert_eq!(status.sources[0].dropped_frames, 56);
    assert_eq!(status.sources[0].buffered_frames, Some(0));
    assert_eq!(status.sources[0].mode, SourceMode::Push);
}

#[test]
fn unregister_stops_pull_callbacks() {
    let (mixer, mut renderer) = MixerBuffer::new(config()).expect("mixer");
    let source = id(3);
    let (constant, calls) = Constant::new(0.25, 5_000);
    mixer.set_source_callbacks(source, constant).expect("callbacks");

    let mut out = vec![0.0f32; 128];
    assert_eq!(renderer.dequeue(Some(&mut out), 128), 128);
    assert!(out.iter().all(|s| *s == 0.25));
    assert!(calls.load(Ordering::SeqCst) > 0);

    assert!(mixer.unregister_source(source));
    let seen = calls.load(Ordering::SeqCst);
    assert_eq!(renderer.dequeue(Some(&mut out), 128), 0);
    assert_eq!(calls.load(Ordering::SeqCst), seen);
    assert!(!mixer.unregister_source(source));
}

#[test]
fn replaced_callbacks_are_never_invoked_again() {
    let (mixer, mut renderer) = MixerBuffer::new(config()).expect("mixer");
    let source = id(4);
    let (first, first_calls) = Constant::new(0.25, 0);
    mixer.set_source_callbacks(source, first).expect("callbacks");
    mixer.set_volume(source, 2.0);

    let mut out = vec![0.0f32; 64];
    renderer.dequeue(Some(&mut out), 64);
    assert!(out.iter().all(|s| *s == 0.5));

    let (second, second_calls) = Constant::new(0.125, 64);
    mixer.set_source_callbacks(source, second).expect("callbacks");
    let seen = first_calls.load(Ordering::SeqCst);
    renderer.dequeue(Some(&mut out), 64);
    assert!(out.iter().all(|s| *s == 0.25), "volume carried over: {out:?}");
    assert_eq!(first_calls.load(Ordering::SeqCst), seen);
    assert!(second_calls.load(Ordering::SeqCst) > 0);
    assert_eq!(active_ids(&renderer), vec![source]);
}

#[test]
fn source_limit_is_enforced() {
    let (mixer, _renderer) = MixerBuffer::new(MixerConfig {
        max_sources: 2,
        ..config()
    })
    .expect("mixer");
    mixer.enqueue(id(1), [0.0f32].as_slice(), 0).expect("first");
    mixer.enqueue(id(2), [0.0f32].as_slice(), 0).expect("second");
    let err = mixer
        .enqueue(id(3), [0.0f32].as_slice(), 0)
        .expect_err("third exceeds limit");
    assert!(matches!(err, MixerError::TooManySources(2)));
    assert_eq!(mixer.source_count(), 2);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "pull source")]
fn enqueue_to_pull_source_asserts() {
    let (mixer, _renderer) = MixerBuffer::new(config()).expect("mixer");
    let (constant, _) = Constant::new(0.0, 0);
    mixer.set_source_callbacks(id(5), constant).expect("callbacks");
    let _ = mixer.enqueue(id(5), [0.0f32].as_slice(), 0);
}

#[cfg(not(debug_assertions))]
#[test]
fn enqueue_to_pull_source_is_rejected() {
    let (mixer, _renderer) = MixerBuffer::new(config()).expect("mixer");
    let (constant, _) = Constant::new(0.0, 0);
    mixer.set_source_callbacks(id(5), constant).expect("callbacks");
    let err = mixer
        .enqueue(id(5), [0.0f32].as_slice(), 0)
        .expect_err("mode conflict");
    assert!(matches!(
        err,
        MixerError::ModeConflict {
            existing: SourceMode::Pull,
            ..
        }
    ));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "push source")]
fn callbacks_for_push_source_assert() {
    let (mixer, _renderer) = MixerBuffer::new(config()).expect("mixer");
    mixer.enqueue(id(6), [0.0f32].as_slice(), 0).expect("enqueue");
    let (constant, _) = Constant::new(0.0, 0);
    let _ = mixer.set_source_callbacks(id(6), constant);
}

#[test]
fn render_thread_attaches_and_releases_sources() {
    let (mixer, mut renderer) = MixerBuffer::new(MixerConfig {
        sync_timeout: Duration::from_secs(2),
        stale_cycles: u32::MAX,
        ..config()
    })
    .expect("mixer");
    let stop = Arc::new(AtomicBool::new(false));
    let rendered = Arc::new(AtomicU64::new(0));

    let render_thread = {
        let stop = stop.clone();
        let rendered = rendered.clone();
        thread::spawn(move || {
            let mut out = vec![0.0f32; 64];
            while !stop.load(Ordering::Acquire) {
                let frames = renderer.dequeue(Some(&mut out), 64);
                rendered.fetch_add(frames as u64, Ordering::Relaxed);
                thread::sleep(Duration::from_micros(200));
            }
            renderer
        })
    };

    assert!(mixer.register_source(id(1)).expect("register"));
    let (constant, calls) = Constant::new(0.5, 0);
    mixer.set_source_callbacks(id(2), constant).expect("callbacks");
    while calls.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    assert!(mixer.unregister_source(id(2)));
    let seen = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), seen);

    stop.store(true, Ordering::Release);
    let renderer = render_thread.join().expect("render thread");
    assert!(rendered.load(Ordering::Relaxed) > 0);
    assert_eq!(active_ids(&renderer), vec![id(1)]);
}

#[test]
fn registration_without_renderer_times_out() {
    let (mixer, renderer) = MixerBuffer::new(config()).expect("mixer");
    drop(renderer);
    assert!(!mixer.register_source(id(1)).expect("register"));
}
