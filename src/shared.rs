// Constants and small id types shared by the project model and the render thread.

use serde::{Deserialize, Serialize};

pub const MAX_SEQUENCER_STEPS: usize = 64;
pub const DEFAULT_STEP_COUNT: usize = 16;
pub const MAX_TRACKS: usize = 64; // cache capacity reserved up front by the render loop

pub const MIN_BPM: f32 = 30.0;
pub const MAX_BPM: f32 = 240.0;
pub const DEFAULT_BPM: f32 = 120.0;

// the enabled-step mask is a u64
const _: () = assert!(MAX_SEQUENCER_STEPS <= 64);

// Stable track identity. Ids start at 1 and are never reused; 0 means "no track".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl TrackId {
    pub const NONE: TrackId = TrackId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    #[default]
    Synth,
    Sample,
    MidiOut,
    Vst,
}

impl TrackType {
    pub fn to_u8(self) -> u8 {
        match self {
            TrackType::Synth => 0,
            TrackType::Sample => 1,
            TrackType::MidiOut => 2,
            TrackType::Vst => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => TrackType::Sample,
            2 => TrackType::MidiOut,
            3 => TrackType::Vst,
            _ => TrackType::Synth,
        }
    }
}
