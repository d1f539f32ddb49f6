//! Real-time multi-track step-sequenced audio rendering.
//!
//! The control thread edits a [`Project`](pipeline::project::Project): tracks,
//! parameters, step patterns and transport. The render thread runs a
//! [`RenderLoop`](audio::RenderLoop) that reads that state through atomics and
//! short-held locks and pushes 16-bit PCM into an
//! [`AudioDeviceHandler`](device::AudioDeviceHandler).

pub mod audio;
pub mod audio_api;
pub mod config;
pub mod device;
pub mod loader;
pub mod pipeline;
pub mod shared;
