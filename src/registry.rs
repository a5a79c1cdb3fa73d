//! Source registry: the control-side table and the render-side snapshot.
//!
//! The control side owns a `HashMap` behind a `parking_lot::Mutex` that the
//! render thread never touches. Membership changes reach the render thread
//! as [`Command`]s over a bounded channel and are applied at the start of a
//! render call, so one call always sees one consistent set of sources.
//! Anything the render thread releases travels back as [`Garbage`] and is
//! dropped by the next control call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::FrameClock;
use crate::config::MixerConfig;
use crate::error::MixerError;
use crate::format::{AudioFormat, SampleVec};
use crate::ring::TimestampedRing;
use crate::source::{PullAdapter, PullSource, SourceBuffer, SourceId};

/// How a source delivers audio. Fixed at first contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMode {
    /// Audio arrives through `enqueue`.
    Push,
    /// Audio is fetched from a [`PullSource`].
    Pull,
}

/// Activity of a source as seen by the render thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Supplied data within the staleness threshold.
    Active,
    /// Starved past the threshold; removed from mixing.
    Stale,
}

/// Settings recorded for an identifier before it is registered.
#[derive(Clone, Copy, Debug)]
struct Preset {
    format: AudioFormat,
    volume: f32,
    pan: f32,
}

/// Per-source values readable from either side without locking.
pub(crate) struct SourceShared {
    id: SourceId,
    mode: SourceMode,
    volume: AtomicU32,
    pan: AtomicU32,
    format: AtomicU64,
    retired: AtomicBool,
    attached: AtomicBool,
    stale: AtomicBool,
}

impl SourceShared {
    fn new(id: SourceId, mode: SourceMode, preset: Preset) -> Self {
        Self {
            id,
            mode,
            volume: AtomicU32::new(preset.volume.to_bits()),
            pan: AtomicU32::new(preset.pan.to_bits()),
            format: AtomicU64::new(preset.format.to_bits()),
            retired: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            stale: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> SourceId {
        self.id
    }

    pub(crate) fn mode(&self) -> SourceMode {
        self.mode
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn pan(&self) -> f32 {
        f32::from_bits(self.pan.load(Ordering::Relaxed))
    }

    pub(crate) fn set_pan(&self, pan: f32) {
        self.pan.store(pan.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn format(&self) -> AudioFormat {
        AudioFormat::from_bits(self.format.load(Ordering::Acquire))
    }

    fn set_format(&self, format: AudioFormat) {
        self.format.store(format.to_bits(), Ordering::Release);
    }

    fn preset(&self) -> Preset {
        Preset {
            format: self.format(),
            volume: self.volume(),
            pan: self.pan(),
        }
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn mark_attached(&self) {
        self.attached.store(true, Ordering::Release);
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> SourceState {
        if self.stale.load(Ordering::Relaxed) {
            SourceState::Stale
        } else {
            SourceState::Active
        }
    }
}

/// Producer half of a push source; the mutex serialises writers on the control side.
pub(crate) struct PushHandle {
    pub(crate) shared: Arc<SourceShared>,
    pub(crate) ring: Arc<Mutex<Arc<TimestampedRing>>>,
}

struct Entry {
    shared: Arc<SourceShared>,
    ring: Option<Arc<Mutex<Arc<TimestampedRing>>>>,
}

/// Render-side record of one registered source.
pub(crate) struct Slot {
    pub(crate) shared: Arc<SourceShared>,
    pub(crate) buffer: SourceBuffer,
    /// Consecutive render calls that found no data.
    pub(crate) idle_cycles: u32,
    /// Whether the current render call found data.
    pub(crate) saw_data: bool,
    /// Frames consumed since the clock anchor.
    pub(crate) position: u64,
}

/// Membership changes submitted by the control side.
pub(crate) enum Command {
    Attach(Box<Slot>),
    Retune {
        shared: Arc<SourceShared>,
        format: AudioFormat,
        scratch: SampleVec,
    },
}

/// Storage released by the render thread, freed on the control side.
pub(crate) enum Garbage {
    Slot(#[allow(dead_code)] Box<Slot>),
    Scratch(#[allow(dead_code)] SampleVec),
}

#[derive(Default)]
struct Table {
    entries: HashMap<SourceId, Entry>,
    presets: HashMap<SourceId, Preset>,
    backlog: VecDeque<Command>,
}

/// State shared by the control handle and the renderer.
pub(crate) struct Shared {
    pub(crate) config: MixerConfig,
    pub(crate) frame_clock: FrameClock,
    table: Mutex<Table>,
    commands: Sender<Command>,
    garbage: Receiver<Garbage>,
    /// Incremented on entry to and exit from every render call; odd while rendering.
    pub(crate) render_epoch: AtomicU64,
    pub(crate) renderer_alive: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: MixerConfig) -> (Arc<Self>, ActiveSet) {
        let (command_tx, command_rx) = crossbeam_channel::bounded(config.command_capacity);
        // Between two control-side drains the render thread releases at most
        // every slot it holds plus one item per queued command.
        let garbage_capacity = config.max_sources * 2 + config.command_capacity;
        let (garbage_tx, garbage_rx) = crossbeam_channel::bounded(garbage_capacity);
        let frame_clock = FrameClock::new(config.format.sample_rate, config.host_ticks_per_second);
        let active = ActiveSet {
            slots: Vec::with_capacity(config.max_sources * 2),
            commands: command_rx,
            command_budget: config.command_capacity,
            garbage: garbage_tx,
            deferred: Vec::with_capacity(garbage_capacity),
        };
        let shared = Arc::new(Self {
            config,
            frame_clock,
            table: Mutex::new(Table::default()),
            commands: command_tx,
            garbage: garbage_rx,
            render_epoch: AtomicU64::new(0),
            renderer_alive: AtomicBool::new(true),
        });
        (shared, active)
    }

    fn default_preset(&self) -> Preset {
        Preset {
            format: self.config.format,
            volume: 1.0,
            pan: 0.0,
        }
    }

    /// Free released storage and retry backlogged commands.
    fn housekeeping(&self, table: &mut Table) {
        while self.garbage.try_recv().is_ok() {}
        while let Some(command) = table.backlog.pop_front() {
            match self.commands.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    table.backlog.push_front(command);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    table.backlog.clear();
                    break;
                }
            }
        }
        table.entries.retain(|id, entry| {
            let keep = !entry.shared.is_retired();
            if !keep {
                debug!(source = %id, "dropping evicted source from registry");
            }
            keep
        });
    }

    fn submit(&self, table: &mut Table, command: Command) {
        if !table.backlog.is_empty() {
            table.backlog.push_back(command);
            return;
        }
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                trace!("command queue full, deferring");
                table.backlog.push_back(command);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn check_capacity(&self, table: &Table) -> Result<(), MixerError> {
        if table.entries.len() >= self.config.max_sources {
            return Err(MixerError::TooManySources(self.config.max_sources));
        }
        Ok(())
    }

    /// Register `id` as a push source, or return the existing one.
    pub(crate) fn register_or_touch_push(&self, id: SourceId) -> Result<PushHandle, MixerError> {
        let mut table = self.table.lock();
        self.housekeeping(&mut table);
        if let Some(entry) = table.entries.get(&id) {
            debug_assert_eq!(
                entry.shared.mode(),
                SourceMode::Push,
                "source {id} is a pull source and cannot be enqueued to"
            );
            let Some(ring) = entry.ring.clone() else {
                warn!(source = %id, "enqueue on a pull source ignored");
                return Err(MixerError::ModeConflict {
                    id,
                    existing: SourceMode::Pull,
                });
            };
            return Ok(PushHandle {
                shared: entry.shared.clone(),
                ring,
            });
        }

        self.check_capacity(&table)?;
        let capacity = self.config.ring_capacity_frames;
        let ring = TimestampedRing::try_new(
            capacity,
            self.config.format.channel_count(),
            self.frame_clock,
        )
        .map(Arc::new)
        .ok_or(MixerError::Allocation {
            id,
            frames: capacity,
        })?;

        let preset = table.presets.remove(&id).unwrap_or(self.default_preset());
        let shared = Arc::new(SourceShared::new(id, SourceMode::Push, preset));
        let slot = Box::new(Slot {
            shared: shared.clone(),
            buffer: SourceBuffer::Push(ring.clone()),
            idle_cycles: 0,
            saw_data: false,
            position: 0,
        });
        let ring = Arc::new(Mutex::new(ring));
        table.entries.insert(
            id,
            Entry {
                shared: shared.clone(),
                ring: Some(ring.clone()),
            },
        );
        self.submit(&mut table, Command::Attach(slot));
        debug!(source = %id, capacity, "registered push source");
        Ok(PushHandle { shared, ring })
    }

    /// Register `id` as a pull source, replacing callbacks of an existing pull source.
    pub(crate) fn register_pull(
        &self,
        id: SourceId,
        source: Box<dyn PullSource>,
    ) -> Result<Arc<SourceShared>, MixerError> {
        let (shared, previous) = {
            let mut table = self.table.lock();
            self.housekeeping(&mut table);
            let previous = match table.entries.get(&id) {
                Some(entry) => {
                    debug_assert_eq!(
                        entry.shared.mode(),
                        SourceMode::Pull,
                        "source {id} is a push source and cannot take callbacks"
                    );
                    if entry.shared.mode() != SourceMode::Pull {
                        warn!(source = %id, "callbacks for a push source ignored");
                        return Err(MixerError::ModeConflict {
                            id,
                            existing: SourceMode::Push,
                        });
                    }
                    Some(entry.shared.clone())
                }
                None => {
                    self.check_capacity(&table)?;
                    None
                }
            };

            let preset = match &previous {
                Some(shared) => shared.preset(),
                None => table.presets.remove(&id).unwrap_or(self.default_preset()),
            };
            let scratch = self.pull_scratch(id, &preset.format)?;
            let shared = Arc::new(SourceShared::new(id, SourceMode::Pull, preset));
            let adapter = PullAdapter::new(source, preset.format, self.config.format, scratch);
            let slot = Box::new(Slot {
                shared: shared.clone(),
                buffer: SourceBuffer::Pull(adapter),
                idle_cycles: 0,
                saw_data: false,
                position: 0,
            });
            table.entries.insert(
                id,
                Entry {
                    shared: shared.clone(),
                    ring: None,
                },
            );
            if let Some(previous) = &previous {
                previous.retire();
            }
            self.submit(&mut table, Command::Attach(slot));
            debug!(source = %id, replaced = previous.is_some(), "registered pull source");
            (shared, previous)
        };
        if previous.is_some() {
            self.wait_render_boundary();
        }
        Ok(shared)
    }

    fn pull_scratch(&self, id: SourceId, format: &AudioFormat) -> Result<SampleVec, MixerError> {
        let samples = PullAdapter::scratch_samples(
            format,
            &self.config.format,
            self.config.max_frames_per_slice,
        );
        SampleVec::try_zeroed(format.sample_format, samples).ok_or(MixerError::Allocation {
            id,
            frames: samples / format.channel_count().max(1),
        })
    }

    pub(crate) fn lookup(&self, id: SourceId) -> Option<Arc<SourceShared>> {
        let table = self.table.lock();
        table
            .entries
            .get(&id)
            .filter(|entry| !entry.shared.is_retired())
            .map(|entry| entry.shared.clone())
    }

    pub(crate) fn source_count(&self) -> usize {
        let mut table = self.table.lock();
        self.housekeeping(&mut table);
        table.entries.len()
    }

    /// Change a source's format. Unregistered ids keep it until they register.
    pub(crate) fn set_format(&self, id: SourceId, format: AudioFormat) -> Result<(), MixerError> {
        if !format.is_valid() {
            return Err(MixerError::UnsupportedFormat(format));
        }
        let mut table = self.table.lock();
        self.housekeeping(&mut table);
        let Some(shared) = table.entries.get(&id).map(|entry| entry.shared.clone()) else {
            let default = self.default_preset();
            table.presets.entry(id).or_insert(default).format = format;
            return Ok(());
        };
        if shared.mode() == SourceMode::Pull {
            let scratch = self.pull_scratch(id, &format)?;
            shared.set_format(format);
            self.submit(
                &mut table,
                Command::Retune {
                    shared,
                    format,
                    scratch,
                },
            );
        } else {
            shared.set_format(format);
        }
        debug!(source = %id, %format, "source format changed");
        Ok(())
    }

    pub(crate) fn format_of(&self, id: SourceId) -> AudioFormat {
        self.read_value(id, |shared| shared.format(), |preset| preset.format)
    }

    pub(crate) fn volume_of(&self, id: SourceId) -> f32 {
        self.read_value(id, |shared| shared.volume(), |preset| preset.volume)
    }

    pub(crate) fn pan_of(&self, id: SourceId) -> f32 {
        self.read_value(id, |shared| shared.pan(), |preset| preset.pan)
    }

    pub(crate) fn set_volume(&self, id: SourceId, volume: f32) {
        self.write_value(id, |shared| shared.set_volume(volume), |preset| preset.volume = volume);
    }

    pub(crate) fn set_pan(&self, id: SourceId, pan: f32) {
        let pan = pan.clamp(-1.0, 1.0);
        self.write_value(id, |shared| shared.set_pan(pan), |preset| preset.pan = pan);
    }

    fn read_value<T>(
        &self,
        id: SourceId,
        live: impl FnOnce(&SourceShared) -> T,
        preset: impl FnOnce(&Preset) -> T,
    ) -> T {
        let table = self.table.lock();
        match table.entries.get(&id) {
            Some(entry) => live(&entry.shared),
            None => preset(table.presets.get(&id).unwrap_or(&self.default_preset())),
        }
    }

    fn write_value(
        &self,
        id: SourceId,
        live: impl FnOnce(&SourceShared),
        preset: impl FnOnce(&mut Preset),
    ) {
        let mut table = self.table.lock();
        match table.entries.get(&id) {
            Some(entry) => live(&entry.shared),
            None => {
                let default = self.default_preset();
                preset(table.presets.entry(id).or_insert(default));
            }
        }
    }

    /// Remove `id`. Once this returns the render thread no longer reads the source.
    pub(crate) fn unregister(&self, id: SourceId) -> bool {
        let removed = {
            let mut table = self.table.lock();
            self.housekeeping(&mut table);
            table.presets.remove(&id);
            table.entries.remove(&id)
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.shared.retire();
        self.wait_render_boundary();
        debug!(source = %id, "unregistered source");
        true
    }

    /// Wait until any render call in progress has returned.
    pub(crate) fn wait_render_boundary(&self) {
        let epoch = self.render_epoch.load(Ordering::SeqCst);
        if epoch % 2 == 0 {
            return;
        }
        while self.render_epoch.load(Ordering::SeqCst) == epoch {
            if !self.renderer_alive.load(Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Wait for the render thread to attach `shared`, up to the configured timeout.
    pub(crate) fn wait_attached(&self, shared: &SourceShared) -> bool {
        let deadline = Instant::now() + self.config.sync_timeout;
        while !shared.is_attached() {
            if !self.renderer_alive.load(Ordering::Acquire) {
                return false;
            }
            if Instant::now() >= deadline {
                warn!(source = %shared.id(), "render thread did not attach source in time");
                return false;
            }
            {
                let mut table = self.table.lock();
                self.housekeeping(&mut table);
            }
            std::thread::sleep(Duration::from_micros(250));
        }
        true
    }
}

/// The render thread's snapshot of registered sources.
pub(crate) struct ActiveSet {
    slots: Vec<Box<Slot>>,
    commands: Receiver<Command>,
    /// Commands applied per render call at most.
    command_budget: usize,
    garbage: Sender<Garbage>,
    /// Garbage that found the channel full, retried on the next call.
    deferred: Vec<Garbage>,
}

impl ActiveSet {
    pub(crate) fn slots(&self) -> &[Box<Slot>] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Box<Slot>] {
        &mut self.slots
    }

    pub(crate) fn index_of(&self, id: SourceId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.shared.id() == id)
    }

    fn release(&mut self, garbage: Garbage) {
        match self.garbage.try_send(garbage) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(garbage)) => {
                if self.deferred.len() < self.deferred.capacity() {
                    self.deferred.push(garbage);
                }
            }
        }
    }

    fn flush_deferred(&mut self) {
        while let Some(garbage) = self.deferred.pop() {
            if let Err(TrySendError::Full(garbage)) = self.garbage.try_send(garbage) {
                self.deferred.push(garbage);
                break;
            }
        }
    }

    /// Apply queued commands and drop retired sources. Called first in every render call.
    pub(crate) fn apply_pending(&mut self, position: u64) {
        self.flush_deferred();
        for _ in 0..self.command_budget {
            let Ok(command) = self.commands.try_recv() else {
                break;
            };
            match command {
                Command::Attach(mut slot) => {
                    if slot.shared.is_retired() || self.slots.len() == self.slots.capacity() {
                        slot.shared.retire();
                        self.release(Garbage::Slot(slot));
                        continue;
                    }
                    slot.position = position;
                    slot.shared.mark_attached();
                    debug!(source = %slot.shared.id(), "source attached to render set");
                    self.slots.push(slot);
                }
                Command::Retune {
                    shared,
                    format,
                    scratch,
                } => {
                    let slot = self
                        .slots
                        .iter_mut()
                        .find(|slot| Arc::ptr_eq(&slot.shared, &shared));
                    let freed = match slot.map(|slot| &mut slot.buffer) {
                        Some(SourceBuffer::Pull(adapter)) => adapter.retune(format, scratch),
                        _ => scratch,
                    };
                    self.release(Garbage::Scratch(freed));
                }
            }
        }

        let mut index = 0;
        while index < self.slots.len() {
            if self.slots[index].shared.is_retired() {
                let slot = self.slots.remove(index);
                debug!(source = %slot.shared.id(), "source detached from render set");
                self.release(Garbage::Slot(slot));
            } else {
                index += 1;
            }
        }
    }

    /// Update idle counters after a render call and evict sources idle past `threshold`.
    pub(crate) fn settle(&mut self, threshold: u32, only: Option<usize>) {
        let mut index = 0;
        while index < self.slots.len() {
            if only.is_some_and(|only| only != index) {
                index += 1;
                continue;
            }
            let slot = &mut self.slots[index];
            if slot.saw_data {
                slot.idle_cycles = 0;
            } else {
                slot.idle_cycles = slot.idle_cycles.saturating_add(1);
            }
            slot.saw_data = false;
            if slot.idle_cycles > threshold {
                slot.shared.stale.store(true, Ordering::Relaxed);
                slot.shared.retire();
                let slot = self.slots.remove(index);
                debug!(source = %slot.shared.id(), "evicted stale source");
                self.release(Garbage::Slot(slot));
                if only.is_some() {
                    break;
                }
            } else {
                index += 1;
            }
        }
    }
}
