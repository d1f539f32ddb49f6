use serde::{Deserialize, Serialize};

use crate::shared::TrackId;

use super::params::Param;
use super::registry::TrackRegistry;

// One routing from a modulation source to a track parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModAssignment {
    pub id: u32,
    pub source: usize,
    pub target_track: TrackId,
    pub target_param: usize, // Param::index
    pub depth: f32,          // normalized, [-1, 1]
}

impl ModAssignment {
    /// Depth scaled to the target parameter's range, or `None` if the target
    /// index names no parameter.
    pub fn denormalized(&self) -> Option<(Param, f32)> {
        let param = Param::from_index(self.target_param)?;
        Some((param, self.depth * param.spec().range()))
    }
}

/// Flat list of modulation routings. Not real-time: it runs on the control
/// thread and writes through the same registry setters as any edit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModMatrix {
    assignments: Vec<ModAssignment>,
    next_id: u32,
}

impl ModMatrix {
    pub fn new() -> Self {
        Self { assignments: Vec::new(), next_id: 1 }
    }

    pub fn add(&mut self, source: usize, target_track: TrackId, target_param: usize, depth: f32) -> u32 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.assignments.push(ModAssignment {
            id,
            source,
            target_track,
            target_param,
            depth: clamp_depth(depth),
        });
        id
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.assignments.len();
        self.assignments.retain(|a| a.id != id);
        self.assignments.len() != before
    }

    // drop every routing that points at a track that is going away
    pub fn remove_track(&mut self, track: TrackId) {
        self.assignments.retain(|a| a.target_track != track);
    }

    pub fn set_depth(&mut self, id: u32, depth: f32) -> bool {
        match self.assignments.iter_mut().find(|a| a.id == id) {
            Some(a) => {
                a.depth = clamp_depth(depth);
                true
            }
            None => false,
        }
    }

    pub fn assignments(&self) -> &[ModAssignment] {
        &self.assignments
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Push every routing's denormalized depth into its target setter (which
    /// clamps). Returns how many routings landed on a live track.
    pub fn apply(&self, registry: &TrackRegistry) -> usize {
        self.assignments
            .iter()
            .filter_map(|a| a.denormalized().map(|(param, value)| (a.target_track, param, value)))
            .filter(|(track, param, value)| registry.set_param(*track, *param, *value))
            .count()
    }
}

fn clamp_depth(depth: f32) -> f32 {
    if depth.is_nan() { 0.0 } else { depth.clamp(-1.0, 1.0) }
}
