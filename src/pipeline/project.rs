// The control-thread face of the engine: everything the UI, MIDI mapping or a
// script would call. It bundles the shared state the render loop reads, and
// keeps the cross-object rules (active track, cursor clamping) in one place.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio::SampleBuffer;
use crate::loader::sample_loader::{self, DecodeError};
use crate::shared::{DEFAULT_STEP_COUNT, TrackId, TrackType};

use super::mod_matrix::ModMatrix;
use super::registry::{Track, TrackRegistry};
use super::sequencer::{Sequencer, Transport};

pub struct Project {
    registry: Arc<TrackRegistry>,
    sequencer: Arc<Sequencer>,
    transport: Arc<Transport>,
    mod_matrix: Mutex<ModMatrix>,
}

impl Project {
    pub fn new(bpm: f32) -> Self {
        Self {
            registry: Arc::new(TrackRegistry::new()),
            sequencer: Arc::new(Sequencer::new(bpm)),
            transport: Arc::new(Transport::new()),
            mod_matrix: Mutex::new(ModMatrix::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TrackRegistry> {
        &self.registry
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    // ── tracks ────────────────────────────────────────────────────

    /// Add a track; the first one added becomes the active track. None once
    /// the track limit is reached.
    pub fn add_track(&self, name: &str, track_type: TrackType) -> Option<Track> {
        let track = self.registry.add_track(name, track_type)?;
        if !self.registry.contains(self.sequencer.active_track()) {
            self.sequencer.set_active_track(track.id);
        }
        Some(track)
    }

    pub fn remove_track(&self, id: TrackId) -> bool {
        if !self.registry.remove_track(id) {
            return false;
        }
        self.mod_matrix().remove_track(id);
        if self.sequencer.active_track() == id {
            let next = self.registry.first_track_id().unwrap_or(TrackId::NONE);
            self.sequencer.set_active_track(next);
        }
        true
    }

    pub fn select_track(&self, id: TrackId) -> bool {
        if !self.registry.contains(id) {
            return false;
        }
        self.sequencer.set_active_track(id);
        true
    }

    pub fn active_track(&self) -> Option<TrackId> {
        let id = self.sequencer.active_track();
        self.registry.contains(id).then_some(id)
    }

    /// Step count governing cursor wraparound: the active track's, else the
    /// first track's, else the default width.
    pub fn active_step_count(&self) -> usize {
        self.active_track()
            .or_else(|| self.registry.first_track_id())
            .and_then(|id| self.registry.step_count(id))
            .unwrap_or(DEFAULT_STEP_COUNT)
    }

    /// Resize a track's pattern. When the active track actually changes size
    /// the cursor is clamped into the new range and a reset is requested.
    pub fn set_sequencer_step_count(&self, id: TrackId, count: usize) -> Option<usize> {
        let old = self.registry.step_count(id)?;
        let new = self.registry.set_step_count(id, count)?;
        if new != old && self.sequencer.active_track() == id {
            let cursor = self.sequencer.current_step();
            if cursor >= new {
                self.sequencer.set_current_step(new - 1);
            }
            self.sequencer.request_reset();
        }
        Some(new)
    }

    pub fn toggle_step(&self, id: TrackId, step: usize) -> Option<bool> {
        self.registry.toggle_step(id, step)
    }

    // ── transport ─────────────────────────────────────────────────

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    pub fn set_playing(&self, playing: bool) {
        if self.transport.set_playing(playing) != playing {
            log::info!("transport {}", if playing { "started" } else { "stopped" });
        }
    }

    pub fn toggle_playing(&self) -> bool {
        let playing = self.transport.toggle();
        log::info!("transport {}", if playing { "started" } else { "stopped" });
        playing
    }

    pub fn bpm(&self) -> f32 {
        self.sequencer.bpm()
    }

    pub fn set_bpm(&self, bpm: f32) -> f32 {
        self.sequencer.set_bpm(bpm)
    }

    // ── samples ───────────────────────────────────────────────────

    /// Decode `path` and install it on a track. On failure the track keeps
    /// whatever buffer it had.
    pub fn load_sample(&self, id: TrackId, path: &Path) -> Result<Arc<SampleBuffer>, DecodeError> {
        let buffer = match sample_loader::decode_wav(path) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                log::warn!("track {id}: {e}");
                return Err(e);
            }
        };
        if !self.registry.set_sample_buffer(id, buffer.clone(), Some(path.to_path_buf())) {
            log::debug!("track {id} vanished before its sample finished loading");
            return Ok(buffer);
        }
        log::info!("track {id}: loaded {} ({:.2} s)", path.display(), buffer.duration_secs());
        Ok(buffer)
    }

    // ── modulation ────────────────────────────────────────────────

    pub fn mod_matrix(&self) -> MutexGuard<'_, ModMatrix> {
        self.mod_matrix.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply_modulation(&self) -> usize {
        let matrix = self.mod_matrix().clone();
        matrix.apply(&self.registry)
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new(crate::shared::DEFAULT_BPM)
    }
}
