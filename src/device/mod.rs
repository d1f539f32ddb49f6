mod backend;
mod cpal_backend;
mod error;
mod handler;
mod offline;

pub use backend::{DeviceBackend, DeviceInfo, DeviceSession, StreamFormat};
pub use cpal_backend::{CpalBackend, DEFAULT_LATENCY_FRAMES};
pub use error::{DeviceError, DeviceResult};
pub use handler::{AudioDeviceHandler, DeviceBuffer, DeviceState, InitRequest, InitTicket};
pub use offline::{OfflineBackend, OfflineCapture};
