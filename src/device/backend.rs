use serde::{Deserialize, Serialize};

use super::error::DeviceResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

// The render loop always writes 16-bit; bits_per_sample is what the endpoint reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl StreamFormat {
    pub const FALLBACK: StreamFormat = StreamFormat { channels: 2, sample_rate: 44100, bits_per_sample: 16 };

    pub fn is_usable(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0
    }
}

pub trait DeviceBackend: Send + Sync {
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>>;

    fn default_device(&self) -> DeviceResult<DeviceInfo>;

    fn open(&self, id: &str) -> DeviceResult<Box<dyn DeviceSession>>;
}

// Driven as mix_format, initialize, then any mix of start, buffer traffic and stop.
pub trait DeviceSession: Send {
    fn info(&self) -> &DeviceInfo;

    // may report zero channels
    fn mix_format(&self) -> DeviceResult<StreamFormat>;

    fn initialize(&mut self, format: StreamFormat) -> DeviceResult<()>;

    fn buffer_frame_count(&self) -> u32;

    // frames queued but not yet played
    fn current_padding(&mut self) -> DeviceResult<u32>;

    fn get_buffer(&mut self, frames: u32) -> DeviceResult<()>;

    fn buffer_mut(&mut self) -> &mut [i16];

    fn release_buffer(&mut self, frames: u32) -> DeviceResult<()>;

    fn start(&mut self) -> DeviceResult<()>;

    fn stop(&mut self) -> DeviceResult<()>;
}
