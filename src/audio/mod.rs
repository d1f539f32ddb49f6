mod delay;
mod dynamics;
mod effect;
mod engine;
mod frame;
pub mod plugin;
mod sample_buffer;
mod sidechain;
mod voice;

pub use delay::{DelayEffect, MAX_DELAY_SECONDS};
pub use dynamics::{Compressor, ThreeBandEq, db_to_linear, linear_to_db};
pub use effect::{Effect, EffectSpec};
pub use engine::{DEFAULT_POLL_INTERVAL, Engine, RenderHandle, RenderLoop};
pub use frame::StereoFrame;
pub use plugin::{PluginEffect, PluginError, PluginLibrary};
pub use sample_buffer::SampleBuffer;
pub use sidechain::{SidechainProcessor, one_pole_coefficient};
pub use voice::{Envelope, SamplePlayer, midi_to_hz, pan_frame};
