//! Error types for the sensor-fusion and elevation-broadcast engine.

use thiserror::Error;

/// Errors produced by the engine's components.
#[derive(Debug, Error)]
pub enum Error {
    /// No matching physical device was found for an adapter.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No frame arrived from a device within its deadline.
    #[error("device timeout after {0}ms")]
    DeviceTimeout(u64),

    /// A device produced a frame that failed to decode.
    #[error("device protocol error: {0}")]
    DeviceProtocol(String),

    /// The pipeline has no usable calibration yet.
    #[error("not calibrated")]
    NotCalibrated,

    /// A proposed calibration failed validation.
    #[error("calibration invalid: {0}")]
    CalibrationInvalid(String),

    /// A stored calibration file could not be parsed.
    #[error("calibration corrupt: {0}")]
    CalibrationCorrupt(String),

    /// No calibration is stored for the requested profile.
    #[error("calibration missing for profile {0}")]
    CalibrationMissing(String),

    /// The frame synchronizer could not assemble a coherent tuple.
    #[error("sync gap: {0}")]
    SyncGap(String),

    /// A pipeline tick exceeded its time budget.
    #[error("pipeline overrun: tick took {0}ms, budget {1}ms")]
    PipelineOverrun(u64, u64),

    /// A subscriber fell behind and was disconnected.
    #[error("subscriber too slow, disconnected after {0} consecutive drops")]
    SubscriberSlow(u32),

    /// A subscriber sent a malformed control message.
    #[error("subscriber protocol error: {0}")]
    SubscriberProtocol(String),

    /// Configuration supplied at startup was invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An I/O operation failed in a way that cannot be recovered from.
    #[error("fatal I/O error: {0}")]
    Io(String),

    /// The component is shutting down cooperatively.
    #[error("shutdown")]
    Shutdown,
}

impl Error {
    /// Whether this error should terminate the process, per the CLI exit-code table.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Io(_) | Error::CalibrationCorrupt(_)
        )
    }

    /// Maps a (possibly fatal) error onto the CLI's exit-code contract.
    ///
    /// 0 is reserved for clean shutdown and is never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 2,
            Error::Io(_) => 3,
            Error::CalibrationCorrupt(_) => 4,
            _ => 1,
        }
    }

    pub fn device_unavailable(msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    pub fn device_protocol(msg: impl Into<String>) -> Self {
        Self::DeviceProtocol(msg.into())
    }

    pub fn calibration_invalid(msg: impl Into<String>) -> Self {
        Self::CalibrationInvalid(msg.into())
    }

    pub fn sync_gap(msg: impl Into<String>) -> Self {
        Self::SyncGap(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::CalibrationCorrupt(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::CalibrationInvalid(e.to_string())
    }
}
