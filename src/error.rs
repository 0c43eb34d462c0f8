use crate::types::Sensors;
use std::fmt;
use std::time::Duration;

/// Errors surfaced by the stream controller, its sources and the archive.
#[derive(Debug, thiserror::Error)]
pub enum TiltError {
    #[error("Connection to {device_id} timed out after {timeout:?}")]
    ConnectionTimeout { device_id: String, timeout: Duration },

    #[error("Invalid device argument: {0}")]
    InvalidDeviceArgument(String),

    #[error("No remote device connected")]
    NotConnected,

    #[error("Sensor not available on this device: {0:?}")]
    SensorUnavailable(Sensors),

    #[error("Sensor transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream worker stopped")]
    WorkerStopped,

    #[error("Failed to spawn stream worker: {0}")]
    Spawn(String),
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &TiltError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
