// Step/note data for one track. Note lists are variable-size, so they sit behind a
// per-track mutex; the "is this step enabled" bit is mirrored into an AtomicU64 so the
// render thread can evaluate gates without taking the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::shared::MAX_SEQUENCER_STEPS;

pub const DEFAULT_VELOCITY: u8 = 100;
pub const MIN_VELOCITY: u8 = 1;
pub const MAX_VELOCITY: u8 = 127;
pub const MAX_PITCH_OFFSET: f32 = 24.0; // semitones, both directions

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepNote {
    pub note: u8,
    pub velocity: u8,
    pub pan: f32,
    pub pitch: f32,
}

impl StepNote {
    pub fn new(note: u8, velocity: u8, pan: f32, pitch: f32) -> Self {
        Self {
            note: note.min(127),
            velocity: clamp_velocity(velocity),
            pan: clamp_pan(pan),
            pitch: clamp_pitch(pitch),
        }
    }

    // the single note a step gets when it is switched on without an explicit note list
    pub fn canonical(note: u8) -> Self {
        Self::new(note, DEFAULT_VELOCITY, 0.0, 0.0)
    }

    pub fn gain(&self) -> f32 {
        self.velocity as f32 / MAX_VELOCITY as f32
    }
}

pub fn clamp_velocity(v: u8) -> u8 {
    v.clamp(MIN_VELOCITY, MAX_VELOCITY)
}

pub fn clamp_pan(p: f32) -> f32 {
    if p.is_nan() { 0.0 } else { p.clamp(-1.0, 1.0) }
}

pub fn clamp_pitch(p: f32) -> f32 {
    if p.is_nan() { 0.0 } else { p.clamp(-MAX_PITCH_OFFSET, MAX_PITCH_OFFSET) }
}

/// All `MAX_SEQUENCER_STEPS` steps of a track, regardless of its current step
/// count. Shrinking the step count never drops data, so growing back restores
/// the old pattern.
#[derive(Debug)]
pub struct StepGrid {
    steps: Mutex<Vec<Vec<StepNote>>>,
    enabled: AtomicU64,
}

impl StepGrid {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(vec![Vec::new(); MAX_SEQUENCER_STEPS]),
            enabled: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<StepNote>>> {
        // a panicked editor leaves plain data behind; keep using it
        self.steps.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_bit(&self, step: usize, notes: &[StepNote]) {
        let bit = 1u64 << step;
        if notes.is_empty() {
            self.enabled.fetch_and(!bit, Ordering::Relaxed);
        } else {
            self.enabled.fetch_or(bit, Ordering::Relaxed);
        }
    }

    // ── lock-free reads ───────────────────────────────────────────

    #[inline]
    pub fn is_enabled(&self, step: usize) -> bool {
        step < MAX_SEQUENCER_STEPS && (self.enabled.load(Ordering::Relaxed) >> step) & 1 == 1
    }

    pub fn enabled_mask(&self) -> u64 {
        self.enabled.load(Ordering::Relaxed)
    }

    // For the render thread: never waits on an editor. Contended or empty → None.
    pub fn try_first_note(&self, step: usize) -> Option<StepNote> {
        let steps = self.steps.try_lock().ok()?;
        steps.get(step)?.first().copied()
    }

    // ── edits ─────────────────────────────────────────────────────

    /// Enable or disable a step. Enabling a step with no notes inserts the
    /// canonical note; enabling an already populated step leaves it alone.
    pub fn set_enabled(&self, step: usize, on: bool, canonical_note: u8) -> bool {
        let mut steps = self.lock();
        let Some(notes) = steps.get_mut(step) else {
            return false;
        };
        if on {
            if notes.is_empty() {
                notes.push(StepNote::canonical(canonical_note));
            }
        } else {
            notes.clear();
        }
        self.sync_bit(step, notes);
        true
    }

    /// Flip a step; returns the new state, or `None` for an out-of-range step.
    pub fn toggle(&self, step: usize, canonical_note: u8) -> Option<bool> {
        let mut steps = self.lock();
        let notes = steps.get_mut(step)?;
        if notes.is_empty() {
            notes.push(StepNote::canonical(canonical_note));
        } else {
            notes.clear();
        }
        self.sync_bit(step, notes);
        Some(!notes.is_empty())
    }

    pub fn notes(&self, step: usize) -> Vec<StepNote> {
        self.lock().get(step).cloned().unwrap_or_default()
    }

    pub fn has_note(&self, step: usize, note: u8) -> bool {
        self.lock()
            .get(step)
            .is_some_and(|notes| notes.iter().any(|n| n.note == note))
    }

    // Adding a note that is already present replaces its settings.
    pub fn add_note(&self, step: usize, note: StepNote) -> bool {
        let mut steps = self.lock();
        let Some(notes) = steps.get_mut(step) else {
            return false;
        };
        match notes.iter_mut().find(|n| n.note == note.note) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        }
        self.sync_bit(step, notes);
        true
    }

    pub fn remove_note(&self, step: usize, note: u8) -> bool {
        let mut steps = self.lock();
        let Some(notes) = steps.get_mut(step) else {
            return false;
        };
        let before = notes.len();
        notes.retain(|n| n.note != note);
        self.sync_bit(step, notes);
        notes.len() != before
    }

    pub fn clear(&self) {
        let mut steps = self.lock();
        for notes in steps.iter_mut() {
            notes.clear();
        }
        self.enabled.store(0, Ordering::Relaxed);
    }

    // Step-level values read the first note and write every note on the step.

    pub fn velocity(&self, step: usize) -> Option<u8> {
        self.lock().get(step)?.first().map(|n| n.velocity)
    }

    pub fn set_velocity(&self, step: usize, velocity: u8) -> bool {
        self.update_notes(step, |n| n.velocity = clamp_velocity(velocity))
    }

    pub fn pan(&self, step: usize) -> Option<f32> {
        self.lock().get(step)?.first().map(|n| n.pan)
    }

    pub fn set_pan(&self, step: usize, pan: f32) -> bool {
        self.update_notes(step, |n| n.pan = clamp_pan(pan))
    }

    pub fn pitch(&self, step: usize) -> Option<f32> {
        self.lock().get(step)?.first().map(|n| n.pitch)
    }

    pub fn set_pitch(&self, step: usize, pitch: f32) -> bool {
        self.update_notes(step, |n| n.pitch = clamp_pitch(pitch))
    }

    fn update_notes(&self, step: usize, mut f: impl FnMut(&mut StepNote)) -> bool {
        let mut steps = self.lock();
        match steps.get_mut(step) {
            Some(notes) if !notes.is_empty() => {
                notes.iter_mut().for_each(&mut f);
                true
            }
            _ => false,
        }
    }
}

impl Default for StepGrid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabling_inserts_exactly_one_canonical_note() {
        let grid = StepGrid::new();
        assert!(grid.set_enabled(3, true, 60));
        assert!(grid.set_enabled(3, true, 60));
        assert_eq!(grid.notes(3), vec![StepNote::canonical(60)]);
        assert!(grid.is_enabled(3));
        assert_eq!(grid.enabled_mask(), 1 << 3);
    }

    #[test]
    fn toggle_twice_restores_state() {
        let grid = StepGrid::new();
        assert_eq!(grid.toggle(5, 48), Some(true));
        assert_eq!(grid.toggle(5, 48), Some(false));
        assert!(!grid.is_enabled(5));
        assert_eq!(grid.toggle(MAX_SEQUENCER_STEPS, 48), None);
    }

    #[test]
    fn per_note_edits_keep_the_mask_in_sync() {
        let grid = StepGrid::new();
        grid.add_note(0, StepNote::new(60, 90, 0.0, 0.0));
        grid.add_note(0, StepNote::new(64, 90, 0.0, 0.0));
        grid.add_note(0, StepNote::new(64, 30, 0.0, 0.0));
        assert_eq!(grid.notes(0).len(), 2);
        assert!(grid.has_note(0, 64));
        assert!(grid.remove_note(0, 60));
        assert!(grid.is_enabled(0));
        assert!(grid.remove_note(0, 64));
        assert!(!grid.is_enabled(0));
        assert!(!grid.remove_note(0, 64));
    }

    #[test]
    fn step_values_are_clamped() {
        let grid = StepGrid::new();
        assert!(!grid.set_velocity(2, 50)); // nothing to edit yet
        grid.set_enabled(2, true, 60);
        grid.set_velocity(2, 0);
        grid.set_pan(2, 4.0);
        grid.set_pitch(2, -99.0);
        assert_eq!(grid.velocity(2), Some(MIN_VELOCITY));
        assert_eq!(grid.pan(2), Some(1.0));
        assert_eq!(grid.pitch(2), Some(-MAX_PITCH_OFFSET));
        assert_eq!(StepNote::new(200, 200, 0.0, 0.0).note, 127);
    }

    #[test]
    fn out_of_range_steps_are_no_ops() {
        let grid = StepGrid::new();
        assert!(!grid.set_enabled(MAX_SEQUENCER_STEPS, true, 60));
        assert!(!grid.is_enabled(MAX_SEQUENCER_STEPS + 10));
        assert!(grid.notes(999).is_empty());
        assert_eq!(grid.velocity(999), None);
    }
}
