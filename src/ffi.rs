//! C ABI over [`MixerBuffer`] and [`Renderer`].
//!
//! Source identifiers are non-zero integers chosen by the caller. Null
//! handles are ignored and report zero or `false`.

use std::ffi::c_void;
use std::ptr;
use std::slice;

use tracing::warn;

use crate::clock::host_time_now;
use crate::format::{AudioFormat, SampleBuffer, SampleBufferMut, SampleFormat};
use crate::mixer::{MixerBuffer, Renderer};
use crate::source::{PullSource, SourceId};

/// Renders `frames` frames in the source's format into `audio`; `audio` is null when discarding.
pub type MixbufRenderFn =
    unsafe extern "C" fn(user_info: *mut c_void, frames: u32, audio: *mut c_void);

/// Returns available frames and stores the next frame's host time in `timestamp`.
pub type MixbufPeekFn =
    unsafe extern "C" fn(user_info: *mut c_void, timestamp: *mut u64) -> u32;

/// Audio format as seen from C. `sample_format`: 0 = f32, 1 = i16, 2 = i32.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MixbufFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample representation code.
    pub sample_format: u8,
}

impl MixbufFormat {
    fn to_format(self) -> Option<AudioFormat> {
        let format = AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::from_bits(self.sample_format)?,
        };
        format.is_valid().then_some(format)
    }
}

fn source_id(raw: u64) -> Option<SourceId> {
    let id = SourceId::new(raw);
    debug_assert!(id.is_some(), "source id 0 is reserved");
    id
}

struct UserInfo(*mut c_void);

// The caller guarantees `user_info` may be used from the render thread.
unsafe impl Send for UserInfo {}

struct CallbackSource {
    render: MixbufRenderFn,
    peek: MixbufPeekFn,
    user_info: UserInfo,
}

impl PullSource for CallbackSource {
    fn render(&mut self, frames: usize, audio: Option<SampleBufferMut<'_>>) {
        let data = match audio {
            Some(SampleBufferMut::F32(s)) => s.as_mut_ptr().cast(),
            Some(SampleBufferMut::I16(s)) => s.as_mut_ptr().cast(),
            Some(SampleBufferMut::I32(s)) => s.as_mut_ptr().cast(),
            None => ptr::null_mut(),
        };
        unsafe { (self.render)(self.user_info.0, frames as u32, data) }
    }

    fn peek(&mut self) -> (usize, u64) {
        let mut timestamp = 0u64;
        let frames = unsafe { (self.peek)(self.user_info.0, &mut timestamp) };
        (frames as usize, timestamp)
    }
}

/// Create a mixer with an interleaved `f32` canonical format.
///
/// Stores the render handle in `renderer` and returns the control handle, or
/// null when the format is invalid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_new(
    sample_rate: u32,
    channels: u16,
    renderer: *mut *mut Renderer,
) -> *mut MixerBuffer {
    crate::init_tracing();
    if renderer.is_null() {
        return ptr::null_mut();
    }
    match MixerBuffer::with_format(AudioFormat::f32(sample_rate, channels)) {
        Ok((mixer, render)) => unsafe {
            *renderer = Box::into_raw(Box::new(render));
            Box::into_raw(Box::new(mixer))
        },
        Err(err) => {
            warn!(%err, "mixbuf_new failed");
            ptr::null_mut()
        }
    }
}

/// Free a control handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_control_free(mixer: *mut MixerBuffer) {
    if !mixer.is_null() {
        unsafe {
            drop(Box::from_raw(mixer));
        }
    }
}

/// Free a render handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_renderer_free(renderer: *mut Renderer) {
    if !renderer.is_null() {
        unsafe {
            drop(Box::from_raw(renderer));
        }
    }
}

/// Enqueue `frames` frames in the source's declared format.
///
/// Null `data` or zero `frames` registers the source synchronously.
/// Returns canonical frames stored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_enqueue(
    mixer: *const MixerBuffer,
    id: u64,
    data: *const c_void,
    frames: u32,
    host_time: u64,
) -> u32 {
    let (Some(mixer), Some(id)) = (unsafe { mixer.as_ref() }, source_id(id)) else {
        return 0;
    };
    let result = if data.is_null() || frames == 0 {
        mixer.enqueue(id, &[] as &[f32], host_time)
    } else {
        let format = mixer.format_of(id);
        let samples = frames as usize * format.channels as usize;
        let audio = unsafe {
            match format.sample_format {
                SampleFormat::F32 => SampleBuffer::F32(slice::from_raw_parts(data.cast(), samples)),
                SampleFormat::I16 => SampleBuffer::I16(slice::from_raw_parts(data.cast(), samples)),
                SampleFormat::I32 => SampleBuffer::I32(slice::from_raw_parts(data.cast(), samples)),
            }
        };
        mixer.enqueue(id, audio, host_time)
    };
    match result {
        Ok(written) => written as u32,
        Err(err) => {
            warn!(source = %id, %err, "mixbuf_enqueue failed");
            0
        }
    }
}

/// Install pull callbacks for a source; a null callback unregisters it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_set_source_callbacks(
    mixer: *const MixerBuffer,
    id: u64,
    render: Option<MixbufRenderFn>,
    peek: Option<MixbufPeekFn>,
    user_info: *mut c_void,
) -> bool {
    let (Some(mixer), Some(id)) = (unsafe { mixer.as_ref() }, source_id(id)) else {
        return false;
    };
    let (Some(render), Some(peek)) = (render, peek) else {
        return mixer.unregister_source(id);
    };
    let source = CallbackSource {
        render,
        peek,
        user_info: UserInfo(user_info),
    };
    match mixer.set_source_callbacks(id, source) {
        Ok(()) => true,
        Err(err) => {
            warn!(source = %id, %err, "mixbuf_set_source_callbacks failed");
            false
        }
    }
}

/// Mix `frames` frames into `out`, or discard them when `out` is null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_dequeue(
    renderer: *mut Renderer,
    out: *mut f32,
    frames: u32,
) -> u32 {
    let Some(renderer) = (unsafe { renderer.as_mut() }) else {
        return 0;
    };
    let samples = frames as usize * renderer.format().channels as usize;
    let out = (!out.is_null()).then(|| unsafe { slice::from_raw_parts_mut(out, samples) });
    renderer.dequeue(out, frames as usize) as u32
}

/// Synchronised audio of one source into `out`, or discarded when `out` is null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_dequeue_single_source(
    renderer: *mut Renderer,
    id: u64,
    out: *mut f32,
    frames: u32,
) -> u32 {
    let (Some(renderer), Some(id)) = (unsafe { renderer.as_mut() }, source_id(id)) else {
        return 0;
    };
    let samples = frames as usize * renderer.format().channels as usize;
    let out = (!out.is_null()).then(|| unsafe { slice::from_raw_parts_mut(out, samples) });
    renderer.dequeue_single_source(id, out, frames as usize) as u32
}

/// Frames available to dequeue; stores the next output timestamp (0 when unknown).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_peek(renderer: *mut Renderer, timestamp: *mut u64) -> u32 {
    let Some(renderer) = (unsafe { renderer.as_mut() }) else {
        return 0;
    };
    let peek = renderer.peek();
    if let Some(timestamp) = unsafe { timestamp.as_mut() } {
        *timestamp = peek.next_timestamp.unwrap_or(0);
    }
    peek.frames.min(u32::MAX as usize) as u32
}

/// Set a source's linear gain.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_set_volume(mixer: *const MixerBuffer, id: u64, volume: f32) {
    if let (Some(mixer), Some(id)) = (unsafe { mixer.as_ref() }, source_id(id)) {
        mixer.set_volume(id, volume);
    }
}

/// A source's linear gain.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_volume(mixer: *const MixerBuffer, id: u64) -> f32 {
    match (unsafe { mixer.as_ref() }, source_id(id)) {
        (Some(mixer), Some(id)) => mixer.volume_of(id),
        _ => 0.0,
    }
}

/// Set a source's pan in `[-1, 1]`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_set_pan(mixer: *const MixerBuffer, id: u64, pan: f32) {
    if let (Some(mixer), Some(id)) = (unsafe { mixer.as_ref() }, source_id(id)) {
        mixer.set_pan(id, pan);
    }
}

/// A source's pan.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_pan(mixer: *const MixerBuffer, id: u64) -> f32 {
    match (unsafe { mixer.as_ref() }, source_id(id)) {
        (Some(mixer), Some(id)) => mixer.pan_of(id),
        _ => 0.0,
    }
}

/// Declare the format a source delivers in.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_set_audio_description(
    mixer: *const MixerBuffer,
    id: u64,
    format: *const MixbufFormat,
) -> bool {
    let (Some(mixer), Some(id), Some(format)) =
        (unsafe { mixer.as_ref() }, source_id(id), unsafe { format.as_ref() })
    else {
        return false;
    };
    let Some(format) = format.to_format() else {
        warn!(source = %id, ?format, "rejected audio description");
        return false;
    };
    mixer.set_audio_description(id, format).is_ok()
}

/// Stop mixing a source; returns `false` when it was not registered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mixbuf_unregister_source(mixer: *const MixerBuffer, id: u64) -> bool {
    match (unsafe { mixer.as_ref() }, source_id(id)) {
        (Some(mixer), Some(id)) => mixer.unregister_source(id),
        _ => false,
    }
}

/// Current host time in ticks.
#[unsafe(no_mangle)]
pub extern "C" fn mixbuf_host_time_now() -> u64 {
    host_time_now()
}
