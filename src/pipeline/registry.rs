// The authoritative store of every track's parameters, steps and sample buffer.
//
// Two levels of synchronization:
//   - an RwLock over the *set* of tracks (add/remove/enumerate; read-mostly)
//   - per-track atomics for every scalar parameter, a per-track mutex for note lists
// so the render thread only ever takes the shared read lock plus relaxed atomic loads.
//
// Lookups by id are linear. Track counts are in the tens, and a Vec keeps
// enumeration order stable and cheap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::audio::SampleBuffer;
use crate::shared::{MAX_SEQUENCER_STEPS, MAX_TRACKS, TrackId, TrackType};

use super::params::{Param, ParamCells};
use super::steps::{StepGrid, StepNote};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Push notifications for GUI/modulation collaborators. Delivery is lossy:
/// a full subscriber queue drops the event rather than blocking the editor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    TrackListChanged,
    ValuesChanged(TrackId),
}

/// A consistent point-in-time copy of one track. Never mutated in place;
/// edit through the registry and take a new snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub track_type: TrackType,
    pub params: Vec<f32>, // indexed by Param::index
    pub vst_handle: u64,  // 0 = no plugin host attached
    pub enabled_steps: u64,
    pub sample_frames: Option<usize>,
    pub sample_source: Option<PathBuf>,
}

impl Track {
    pub fn param(&self, param: Param) -> f32 {
        self.params.get(param.index()).copied().unwrap_or(param.spec().default)
    }

    pub fn volume(&self) -> f32 {
        self.param(Param::Volume)
    }

    pub fn pan(&self) -> f32 {
        self.param(Param::Pan)
    }

    pub fn midi_note(&self) -> u8 {
        self.param(Param::MidiNote) as u8
    }

    pub fn step_count(&self) -> usize {
        self.param(Param::StepCount) as usize
    }

    pub fn is_step_enabled(&self, step: usize) -> bool {
        step < MAX_SEQUENCER_STEPS && (self.enabled_steps >> step) & 1 == 1
    }
}

#[derive(Debug, Default)]
struct SampleSlot {
    buffer: Option<Arc<SampleBuffer>>,
    source: Option<PathBuf>,
}

/// Live state of one track. Only the registry and the render loop (inside
/// this crate) see it; everyone else gets [`Track`] snapshots.
#[derive(Debug)]
pub(crate) struct TrackData {
    id: TrackId,
    name: RwLock<String>,
    track_type: AtomicU8,
    pub(crate) params: ParamCells,
    vst_handle: AtomicU64,
    pub(crate) steps: StepGrid,
    sample: Mutex<SampleSlot>,
}

impl TrackData {
    fn new(id: TrackId, name: &str, track_type: TrackType) -> Self {
        Self {
            id,
            name: RwLock::new(name.to_string()),
            track_type: AtomicU8::new(track_type.to_u8()),
            params: ParamCells::new(),
            vst_handle: AtomicU64::new(0),
            steps: StepGrid::new(),
            sample: Mutex::new(SampleSlot::default()),
        }
    }

    pub(crate) fn id(&self) -> TrackId {
        self.id
    }

    pub(crate) fn track_type(&self) -> TrackType {
        TrackType::from_u8(self.track_type.load(Ordering::Relaxed))
    }

    pub(crate) fn step_count(&self) -> usize {
        self.params.get(Param::StepCount) as usize
    }

    pub(crate) fn midi_note(&self) -> u8 {
        self.params.get(Param::MidiNote) as u8
    }

    // `None` when an editor holds the slot right now; the caller keeps what it had.
    pub(crate) fn try_sample(&self) -> Option<Option<Arc<SampleBuffer>>> {
        self.sample.try_lock().ok().map(|slot| slot.buffer.clone())
    }

    fn sample_slot(&self) -> MutexGuard<'_, SampleSlot> {
        self.sample.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Track {
        let slot = self.sample_slot();
        Track {
            id: self.id,
            name: self.name.read().unwrap_or_else(|e| e.into_inner()).clone(),
            track_type: self.track_type(),
            params: self.params.values(),
            vst_handle: self.vst_handle.load(Ordering::Relaxed),
            enabled_steps: self.steps.enabled_mask(),
            sample_frames: slot.buffer.as_ref().map(|b| b.frame_count()),
            sample_source: slot.source.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TrackRegistry {
    tracks: RwLock<Vec<Arc<TrackData>>>,
    next_id: AtomicU32,
    subscribers: Mutex<Vec<Sender<RegistryEvent>>>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self {
            tracks: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<TrackData>>> {
        self.tracks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<TrackData>>> {
        self.tracks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, id: TrackId) -> Option<Arc<TrackData>> {
        self.read().iter().find(|t| t.id == id).cloned()
    }

    // Run `f` against a track and announce the change if it did something.
    fn edit<R>(&self, id: TrackId, f: impl FnOnce(&TrackData) -> Option<R>) -> Option<R> {
        let track = self.find(id)?;
        let result = f(track.as_ref());
        if result.is_some() {
            self.notify(RegistryEvent::ValuesChanged(id));
        }
        result
    }

    // ── notifications ─────────────────────────────────────────────

    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = crossbeam_channel::bounded(EVENT_QUEUE_DEPTH);
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn notify(&self, event: RegistryEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
    }

    // ── track set ─────────────────────────────────────────────────

    // None once MAX_TRACKS tracks exist; the render thread only has state for that many.
    pub fn add_track(&self, name: &str, track_type: TrackType) -> Option<Track> {
        let snapshot = {
            let mut tracks = self.write();
            if tracks.len() >= MAX_TRACKS {
                log::warn!("track limit of {MAX_TRACKS} reached, not adding \"{name}\"");
                return None;
            }
            let id = TrackId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let data = Arc::new(TrackData::new(id, name, track_type));
            let snapshot = data.snapshot();
            tracks.push(data);
            snapshot
        };
        log::debug!("added track {} \"{name}\" ({track_type:?})", snapshot.id);
        self.notify(RegistryEvent::TrackListChanged);
        Some(snapshot)
    }

    /// Drop one track. Its id is never handed out again, and a render cycle
    /// still holding the track's data finishes with it undisturbed.
    pub fn remove_track(&self, id: TrackId) -> bool {
        let removed = {
            let mut tracks = self.write();
            let before = tracks.len();
            tracks.retain(|t| t.id != id);
            tracks.len() != before
        };
        if removed {
            log::debug!("removed track {id}");
            self.notify(RegistryEvent::TrackListChanged);
        }
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
        self.notify(RegistryEvent::TrackListChanged);
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.read().iter().map(|t| t.snapshot()).collect()
    }

    pub fn track(&self, id: TrackId) -> Option<Track> {
        self.find(id).map(|t| t.snapshot())
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.read().iter().map(|t| t.id).collect()
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.read().iter().any(|t| t.id == id)
    }

    pub fn first_track_id(&self) -> Option<TrackId> {
        self.read().first().map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Refill `out` with the live track list, reusing its allocation.
    pub(crate) fn collect_live(&self, out: &mut Vec<Arc<TrackData>>) {
        out.clear();
        out.extend(self.read().iter().cloned());
    }

    // ── parameters ────────────────────────────────────────────────

    /// Current value, or the parameter's default for an unknown track.
    pub fn param(&self, id: TrackId, param: Param) -> f32 {
        self.find(id)
            .map(|t| t.params.get(param))
            .unwrap_or(param.spec().default)
    }

    /// Clamp and store. Returns false (and does nothing) for an unknown track.
    pub fn set_param(&self, id: TrackId, param: Param, value: f32) -> bool {
        self.edit(id, |t| Some(t.params.set(param, value))).is_some()
    }

    pub fn volume(&self, id: TrackId) -> f32 {
        self.param(id, Param::Volume)
    }

    pub fn set_volume(&self, id: TrackId, volume: f32) -> bool {
        self.set_param(id, Param::Volume, volume)
    }

    pub fn pan(&self, id: TrackId) -> f32 {
        self.param(id, Param::Pan)
    }

    pub fn set_pan(&self, id: TrackId, pan: f32) -> bool {
        self.set_param(id, Param::Pan, pan)
    }

    pub fn is_muted(&self, id: TrackId) -> bool {
        self.param(id, Param::Mute) >= 0.5
    }

    pub fn set_muted(&self, id: TrackId, muted: bool) -> bool {
        self.set_param(id, Param::Mute, if muted { 1.0 } else { 0.0 })
    }

    pub fn midi_note(&self, id: TrackId) -> u8 {
        self.param(id, Param::MidiNote) as u8
    }

    pub fn set_midi_note(&self, id: TrackId, note: u8) -> bool {
        self.set_param(id, Param::MidiNote, note as f32)
    }

    pub fn step_count(&self, id: TrackId) -> Option<usize> {
        self.find(id).map(|t| t.step_count())
    }

    /// Clamp into [1, MAX_SEQUENCER_STEPS] and store. Step data beyond the
    /// new count is kept. Returns the stored count.
    pub fn set_step_count(&self, id: TrackId, count: usize) -> Option<usize> {
        self.edit(id, |t| Some(t.params.set(Param::StepCount, count as f32) as usize))
    }

    pub fn name(&self, id: TrackId) -> Option<String> {
        self.track(id).map(|t| t.name)
    }

    pub fn set_name(&self, id: TrackId, name: &str) -> bool {
        self.edit(id, |t| {
            *t.name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
            Some(())
        })
        .is_some()
    }

    pub fn track_type(&self, id: TrackId) -> Option<TrackType> {
        self.find(id).map(|t| t.track_type())
    }

    pub fn set_track_type(&self, id: TrackId, track_type: TrackType) -> bool {
        self.edit(id, |t| {
            t.track_type.store(track_type.to_u8(), Ordering::Relaxed);
            Some(())
        })
        .is_some()
    }

    pub fn vst_handle(&self, id: TrackId) -> u64 {
        self.find(id).map(|t| t.vst_handle.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn set_vst_handle(&self, id: TrackId, handle: u64) -> bool {
        self.edit(id, |t| {
            t.vst_handle.store(handle, Ordering::Relaxed);
            Some(())
        })
        .is_some()
    }

    // ── sample buffers ────────────────────────────────────────────

    /// Install a new buffer. The previous one stays alive for as long as a
    /// render cycle still holds it.
    pub fn set_sample_buffer(&self, id: TrackId, buffer: Arc<SampleBuffer>, source: Option<PathBuf>) -> bool {
        self.edit(id, |t| {
            let mut slot = t.sample_slot();
            slot.buffer = Some(buffer);
            slot.source = source;
            Some(())
        })
        .is_some()
    }

    pub fn sample_buffer(&self, id: TrackId) -> Option<Arc<SampleBuffer>> {
        self.find(id)?.sample_slot().buffer.clone()
    }

    pub fn clear_sample_buffer(&self, id: TrackId) -> bool {
        self.edit(id, |t| {
            *t.sample_slot() = SampleSlot::default();
            Some(())
        })
        .is_some()
    }

    // ── steps ─────────────────────────────────────────────────────

    pub fn step_state(&self, id: TrackId, step: usize) -> bool {
        self.find(id).is_some_and(|t| t.steps.is_enabled(step))
    }

    pub fn set_step_state(&self, id: TrackId, step: usize, on: bool) -> bool {
        self.edit(id, |t| t.steps.set_enabled(step, on, t.midi_note()).then_some(())).is_some()
    }

    pub fn toggle_step(&self, id: TrackId, step: usize) -> Option<bool> {
        self.edit(id, |t| t.steps.toggle(step, t.midi_note()))
    }

    pub fn clear_steps(&self, id: TrackId) -> bool {
        self.edit(id, |t| {
            t.steps.clear();
            Some(())
        })
        .is_some()
    }

    pub fn step_notes(&self, id: TrackId, step: usize) -> Vec<StepNote> {
        self.find(id).map(|t| t.steps.notes(step)).unwrap_or_default()
    }

    pub fn add_note(&self, id: TrackId, step: usize, note: StepNote) -> bool {
        self.edit(id, |t| t.steps.add_note(step, note).then_some(())).is_some()
    }

    pub fn remove_note(&self, id: TrackId, step: usize, note: u8) -> bool {
        self.edit(id, |t| t.steps.remove_note(step, note).then_some(())).is_some()
    }

    pub fn note_state(&self, id: TrackId, step: usize, note: u8) -> bool {
        self.find(id).is_some_and(|t| t.steps.has_note(step, note))
    }

    pub fn set_note_state(&self, id: TrackId, step: usize, note: u8, on: bool) -> bool {
        if on {
            if self.note_state(id, step, note) {
                return true;
            }
            self.add_note(id, step, StepNote::canonical(note))
        } else {
            self.remove_note(id, step, note)
        }
    }

    pub fn toggle_note(&self, id: TrackId, step: usize, note: u8) -> Option<bool> {
        let on = !self.note_state(id, step, note);
        self.set_note_state(id, step, note, on).then_some(on)
    }

    pub fn step_velocity(&self, id: TrackId, step: usize) -> Option<u8> {
        self.find(id)?.steps.velocity(step)
    }

    pub fn set_step_velocity(&self, id: TrackId, step: usize, velocity: u8) -> bool {
        self.edit(id, |t| t.steps.set_velocity(step, velocity).then_some(())).is_some()
    }

    pub fn step_pan(&self, id: TrackId, step: usize) -> Option<f32> {
        self.find(id)?.steps.pan(step)
    }

    pub fn set_step_pan(&self, id: TrackId, step: usize, pan: f32) -> bool {
        self.edit(id, |t| t.steps.set_pan(step, pan).then_some(())).is_some()
    }

    pub fn step_pitch(&self, id: TrackId, step: usize) -> Option<f32> {
        self.find(id)?.steps.pitch(step)
    }

    pub fn set_step_pitch(&self, id: TrackId, step: usize, pitch: f32) -> bool {
        self.edit(id, |t| t.steps.set_pitch(step, pitch).then_some(())).is_some()
    }
}

impl Default for TrackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let reg = TrackRegistry::new();
        let a = reg.add_track("kick", TrackType::Sample).unwrap().id;
        let b = reg.add_track("bass", TrackType::Synth).unwrap().id;
        assert!(b > a);
        assert!(reg.remove_track(b));
        assert!(!reg.remove_track(b));
        reg.clear();
        let c = reg.add_track("hat", TrackType::Sample).unwrap().id;
        assert!(c > b);
        assert_eq!(reg.track_ids(), vec![c]);
    }

    #[test]
    fn set_then_get_step_and_toggle_twice() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("t", TrackType::Synth).unwrap().id;
        for step in [0, 7, MAX_SEQUENCER_STEPS - 1] {
            assert!(reg.set_step_state(id, step, true));
            assert!(reg.step_state(id, step));
            let original = reg.step_state(id, step);
            reg.toggle_step(id, step);
            reg.toggle_step(id, step);
            assert_eq!(reg.step_state(id, step), original);
        }
    }

    #[test]
    fn every_setter_clamps() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("t", TrackType::Synth).unwrap().id;
        for param in Param::ALL {
            let spec = param.spec();
            for raw in [spec.min - 1000.0, spec.max + 1000.0, spec.default] {
                reg.set_param(id, param, raw);
                assert_eq!(reg.param(id, param), param.clamp(raw), "{}", spec.name);
            }
        }
        assert_eq!(reg.set_step_count(id, 1000), Some(MAX_SEQUENCER_STEPS));
        assert_eq!(reg.set_step_count(id, 0), Some(1));
    }

    #[test]
    fn shrinking_and_growing_keeps_the_pattern() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("t", TrackType::Synth).unwrap().id;
        for step in [1, 5, 12, 15] {
            reg.set_step_state(id, step, true);
        }
        let before: Vec<bool> = (0..16).map(|s| reg.step_state(id, s)).collect();
        reg.set_step_count(id, 4);
        reg.set_step_count(id, 16);
        let after: Vec<bool> = (0..16).map(|s| reg.step_state(id, s)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn unknown_ids_and_steps_are_quiet_no_ops() {
        let reg = TrackRegistry::new();
        let ghost = TrackId(42);
        assert!(!reg.set_volume(ghost, 0.5));
        assert_eq!(reg.volume(ghost), Param::Volume.spec().default);
        assert!(!reg.step_state(ghost, 0));
        assert_eq!(reg.toggle_step(ghost, 0), None);
        assert!(reg.track(ghost).is_none());

        let id = reg.add_track("t", TrackType::Synth).unwrap().id;
        assert!(!reg.set_step_state(id, MAX_SEQUENCER_STEPS, true));
        assert_eq!(reg.toggle_step(id, 1000), None);
    }

    #[test]
    fn adding_stops_at_the_track_limit() {
        let reg = TrackRegistry::new();
        for i in 0..MAX_TRACKS {
            assert!(reg.add_track(&format!("t{i}"), TrackType::Synth).is_some());
        }
        assert!(reg.add_track("one too many", TrackType::Synth).is_none());
        assert_eq!(reg.len(), MAX_TRACKS);

        // removing frees a slot; the new track still gets a fresh id
        let first = reg.first_track_id().unwrap();
        assert!(reg.remove_track(first));
        let again = reg.add_track("again", TrackType::Synth).unwrap().id;
        assert_eq!(again, TrackId(MAX_TRACKS as u32 + 1));
    }

    #[test]
    fn enabling_uses_the_track_note_and_per_note_edits_coexist() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("keys", TrackType::Synth).unwrap().id;
        reg.set_midi_note(id, 72);
        reg.set_step_state(id, 0, true);
        assert_eq!(reg.step_notes(id, 0), vec![StepNote::canonical(72)]);

        assert_eq!(reg.toggle_note(id, 1, 60), Some(true));
        assert!(reg.set_note_state(id, 1, 64, true));
        assert_eq!(reg.step_notes(id, 1).len(), 2);
        assert!(reg.step_state(id, 1));
        assert_eq!(reg.toggle_note(id, 1, 60), Some(false));
        assert!(reg.set_note_state(id, 1, 64, false));
        assert!(!reg.step_state(id, 1));
    }

    #[test]
    fn snapshots_do_not_follow_later_edits() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("t", TrackType::Sample).unwrap().id;
        reg.set_volume(id, 0.25);
        let snap = reg.track(id).unwrap();
        reg.set_volume(id, 0.75);
        reg.set_name(id, "renamed");
        assert_eq!(snap.volume(), 0.25);
        assert_eq!(snap.name, "t");
        assert_eq!(reg.track(id).unwrap().volume(), 0.75);
    }

    #[test]
    fn replacing_a_buffer_leaves_holders_untouched() {
        let reg = TrackRegistry::new();
        let id = reg.add_track("t", TrackType::Sample).unwrap().id;
        let first = Arc::new(SampleBuffer::new(1, 44100, vec![1, 2, 3]));
        reg.set_sample_buffer(id, first.clone(), None);
        let held = reg.sample_buffer(id).unwrap();
        reg.set_sample_buffer(id, Arc::new(SampleBuffer::new(1, 44100, vec![9])), None);
        assert!(Arc::ptr_eq(&held, &first));
        assert_eq!(held.frame_count(), 3);
        assert_eq!(reg.track(id).unwrap().sample_frames, Some(1));
    }

    #[test]
    fn subscribers_hear_about_changes() {
        let reg = TrackRegistry::new();
        let rx = reg.subscribe();
        let id = reg.add_track("t", TrackType::Synth).unwrap().id;
        reg.set_pan(id, 0.5);
        reg.set_pan(TrackId(999), 0.5);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![RegistryEvent::TrackListChanged, RegistryEvent::ValuesChanged(id)]);
        drop(rx);
        reg.set_pan(id, 0.1); // disconnected subscriber is pruned, not an error
    }
}
