//! Typed error surface for the public API. Per-device, per-write, and
//! per-listener failures inside the scheduler are recovered locally (logged
//! via `tracing` and swallowed) and never take this path; only
//! construction-time misconfiguration and direct `DataPlane` calls surface
//! these variants.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataPlaneError {
    #[error("device must not be nil")]
    NilDevice,

    #[error("write data must not be nil")]
    NilData,

    #[error("device {device_id} is not writable")]
    DeviceNotWritable { device_id: String },

    #[error("transaction id {id} is already in use")]
    DuplicateTransaction { id: String },

    #[error("unsupported command for device {device_id}: {message}")]
    UnsupportedCommand { device_id: String, message: String },

    #[error("device {device_id} I/O error: {message}")]
    DeviceIo { device_id: String, message: String },

    #[error("device write timed out")]
    DeviceWriteTimeout,

    #[error("reading transform failed for device {device_id}: {message}")]
    TransformError { device_id: String, message: String },

    #[error("timestamp {raw:?} does not parse as RFC3339")]
    BadTimestamp { raw: String },

    #[error("rate limiter error: {0}")]
    RateLimiterError(String),

    #[error("invalid plugin settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, DataPlaneError>;
