
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("audio device not initialized")]
    NotInitialized,

    #[error("audio device is not ready yet")]
    NotReady,

    #[error("no audio output devices found")]
    NoDevices,

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to negotiate device format: {0}")]
    Format(String),

    #[error("failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("failed to start or stop audio stream: {0}")]
    StreamControl(String),

    #[error("requested {requested} frames but only {available} are writable")]
    BufferTooLarge { requested: u32, available: u32 },

    // unplugged, driver reset
    #[error("audio device lost")]
    Lost,

    #[error("device initialization was cancelled")]
    Cancelled,
}

impl DeviceError {
    // the render loop waits these out instead of reporting them
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::NotInitialized | DeviceError::NotReady)
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
