// Step-sequencer timing state. The control thread toggles play, BPM and track selection;
// the render thread advances the cursor and acknowledges resets. Everything here is
// a scalar atomic so neither side ever waits on the other.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::shared::{DEFAULT_BPM, MAX_BPM, MIN_BPM, TrackId};

use super::params::AtomicF32;

/// The transport's play flag. Owned outside the sequencer: the sequencer only
/// reacts to its edges.
#[derive(Debug, Default)]
pub struct Transport {
    playing: AtomicBool,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Returns the previous state.
    pub fn set_playing(&self, playing: bool) -> bool {
        self.playing.swap(playing, Ordering::Relaxed)
    }

    /// Returns the new state.
    pub fn toggle(&self) -> bool {
        !self.playing.fetch_xor(true, Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Sequencer {
    current_step: AtomicUsize,
    bpm: AtomicF32,
    reset_requested: AtomicBool,
    active_track: AtomicU32,
}

impl Sequencer {
    pub fn new(bpm: f32) -> Self {
        Self {
            current_step: AtomicUsize::new(0),
            bpm: AtomicF32::new(clamp_bpm(bpm)),
            reset_requested: AtomicBool::new(false),
            active_track: AtomicU32::new(TrackId::NONE.0),
        }
    }

    #[inline]
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::Relaxed)
    }

    pub fn set_current_step(&self, step: usize) {
        self.current_step.store(step, Ordering::Relaxed);
    }

    #[inline]
    pub fn bpm(&self) -> f32 {
        self.bpm.load()
    }

    /// Clamp to [MIN_BPM, MAX_BPM] and store; returns the stored tempo.
    pub fn set_bpm(&self, bpm: f32) -> f32 {
        let bpm = clamp_bpm(bpm);
        self.bpm.store(bpm);
        bpm
    }

    /// Ask the render thread to zero the cursor and every voice. Requests
    /// coalesce: several requests before the next render frame are one reset.
    pub fn request_reset(&self) {
        self.current_step.store(0, Ordering::Relaxed);
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_requested.load(Ordering::Acquire)
    }

    // Consume a pending reset, if any.
    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    pub fn active_track(&self) -> TrackId {
        TrackId(self.active_track.load(Ordering::Relaxed))
    }

    pub fn set_active_track(&self, id: TrackId) {
        self.active_track.store(id.0, Ordering::Relaxed);
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

pub fn clamp_bpm(bpm: f32) -> f32 {
    if bpm.is_nan() { DEFAULT_BPM } else { bpm.clamp(MIN_BPM, MAX_BPM) }
}

/// Samples per sixteenth note.
pub fn step_duration_samples(sample_rate: f64, bpm: f32) -> f64 {
    sample_rate * 60.0 / (clamp_bpm(bpm) as f64 * 4.0)
}

/// What the clock decided for one output frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockTick {
    pub playing: bool,
    pub reset: bool,   // voices must be zeroed before this frame is rendered
    pub trigger: bool, // the cursor landed on a step this frame
    pub step: usize,
}

/// Render-thread side of the sequencer: watches the transport's edges and
/// accumulates frames toward the next step boundary.
#[derive(Debug, Default)]
pub struct StepClock {
    accumulator: f64,
    was_playing: bool,
}

impl StepClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(
        &mut self,
        playing: bool,
        sequencer: &Sequencer,
        step_count: usize,
        step_duration: f64,
    ) -> ClockTick {
        if !playing {
            if self.was_playing {
                // clean retrigger on the next start
                sequencer.request_reset();
                self.was_playing = false;
            }
            return ClockTick { playing: false, reset: false, trigger: false, step: sequencer.current_step() };
        }
        if !self.was_playing {
            sequencer.request_reset();
            self.was_playing = true;
        }

        let mut tick = ClockTick { playing: true, reset: false, trigger: false, step: 0 };
        if sequencer.take_reset() {
            self.accumulator = 0.0;
            sequencer.set_current_step(0);
            tick.reset = true;
            tick.trigger = true;
        }

        self.accumulator += 1.0;
        let mut step = sequencer.current_step();
        if self.accumulator >= step_duration {
            self.accumulator -= step_duration;
            step = (step + 1) % step_count.max(1);
            sequencer.set_current_step(step);
            tick.trigger = true;
        }
        tick.step = step;
        tick
    }
}
