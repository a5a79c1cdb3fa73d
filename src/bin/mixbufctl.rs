use std::env;
use std::process;

use dasp_signal::{self as signal, Signal};

use mixbuf::{
    AudioFormat, FrameClock, MixerBuffer, MixerError, MixerStatus, Renderer, SourceId,
    host_ticks_per_second, host_time_now, init_tracing,
};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_FRAMES: usize = 256;

struct Options {
    blocks: usize,
    offset_frames: u64,
}

fn parse_args() -> Options {
    let mut options = Options {
        blocks: 32,
        offset_frames: 128,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let value = |args: &mut dyn Iterator<Item = String>, name: &str| -> u64 {
            match args.next().and_then(|v| v.parse().ok()) {
                Some(value) => value,
                None => {
                    eprintln!("mixbufctl: {name} expects a number");
                    process::exit(1);
                }
            }
        };
        match arg.as_str() {
            "--blocks" | "-b" => options.blocks = value(&mut args, "--blocks") as usize,
            "--offset" | "-o" => options.offset_frames = value(&mut args, "--offset"),
            "--help" | "-h" => {
                println!("Usage: mixbufctl [--blocks N] [--offset FRAMES]");
                println!();
                println!(
                    "Mixes two sine sources, the second starting FRAMES later, \
                     and prints mixer status."
                );
                process::exit(0);
            }
            other => {
                eprintln!("mixbufctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }
    options
}

fn sine_block(source: &mut impl Signal<Frame = f64>, frames: usize) -> Vec<f32> {
    let mut block = Vec::with_capacity(frames * 2);
    for _ in 0..frames {
        let sample = (source.next() * 0.25) as f32;
        block.push(sample);
        block.push(sample);
    }
    block
}

fn print_status(status: &MixerStatus, rms: f32) {
    println!("Format      : {}", status.format);
    println!("Emitted     : {} frames", status.frames_emitted);
    match status.next_timestamp {
        Some(ts) => println!("Next Time   : {ts}"),
        None => println!("Next Time   : unanchored"),
    }
    println!("Output RMS  : {rms:.3}");
    println!("Sources:");
    for source in &status.sources {
        println!(
            "  [{}] {:?} {:?} | vol={:.2} | pan={:+.2} | buffered={} | dropped={} | idle={}",
            source.id,
            source.mode,
            source.state,
            source.volume,
            source.pan,
            source
                .buffered_frames
                .map_or_else(|| "-".to_string(), |f| f.to_string()),
            source.dropped_frames,
            source.idle_cycles,
        );
    }
}

fn run(options: &Options) -> Result<(), MixerError> {
    let (mixer, mut renderer): (MixerBuffer, Renderer) =
        MixerBuffer::with_format(AudioFormat::f32(SAMPLE_RATE, 2))?;
    let clock = FrameClock::new(SAMPLE_RATE, host_ticks_per_second());
    let missing_id = || MixerError::InvalidConfig("source ids must be non-zero");
    let left = SourceId::new(1).ok_or_else(missing_id)?;
    let right = SourceId::new(2).ok_or_else(missing_id)?;
    mixer.set_pan(left, -0.5);
    mixer.set_pan(right, 0.5);

    let mut tone_a = signal::rate(SAMPLE_RATE as f64).const_hz(440.0).sine();
    let mut tone_b = signal::rate(SAMPLE_RATE as f64).const_hz(660.0).sine();
    let start = host_time_now();

    let mut energy = 0.0f64;
    let mut samples = 0usize;
    for block in 0..options.blocks {
        let frames_before = (block * BLOCK_FRAMES) as u64;
        mixer.enqueue(
            left,
            sine_block(&mut tone_a, BLOCK_FRAMES).as_slice(),
            start + clock.frames_to_ticks(frames_before),
        )?;
        mixer.enqueue(
            right,
            sine_block(&mut tone_b, BLOCK_FRAMES).as_slice(),
            start + clock.frames_to_ticks(frames_before + options.offset_frames),
        )?;
        let out = renderer.dequeue_scratch(BLOCK_FRAMES);
        energy += out.iter().map(|s| (*s as f64).powi(2)).sum::<f64>();
        samples += out.len();
    }

    let rms = if samples == 0 {
        0.0
    } else {
        (energy / samples as f64).sqrt() as f32
    };
    print_status(&renderer.status(), rms);
    Ok(())
}

fn main() {
    init_tracing();
    let options = parse_args();
    if let Err(err) = run(&options) {
        eprintln!("mixbufctl: {err}");
        process::exit(1);
    }
}
