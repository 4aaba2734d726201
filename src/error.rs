//! Custom error types for the rig.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify what can go wrong during a session, from a single late hardware
//! buffer to a storage failure at the end of the run.
//!
//! ## Error Taxonomy
//!
//! - **`HardwareRead`**: A per-block read failure (timeout, overrun). This is the
//!   only recoverable class: the acquisition loop logs it, records a gap and
//!   keeps the master clock running. The exception is a lost device, which
//!   ends acquisition; the session still saves what it collected.
//! - **`HardwareConfig`**: The driver could not be configured or started. Fatal
//!   before acquisition begins.
//! - **`HardwareWrite`**: A digital or analog output write failed. During
//!   acquisition the loop logs it, counts it and keeps going.
//! - **`InvalidConfiguration`**: The protocol or rig configuration failed
//!   validation. Fatal at state-machine construction.
//! - **`Serialization`**: Writing the accumulated session to storage failed.
//!   Fatal during the flush; there is no partial-save recovery.
//! - **`CameraTimeout`**: A camera never reported its data as flushed within the
//!   bounded wait.
//!
//! Everything except `HardwareRead` propagates to the orchestrating caller.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// A failed block read. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareReadError {
    /// The driver did not deliver the requested samples in time.
    #[error("read of {requested} samples timed out after {timeout:?}")]
    Timeout {
        /// Samples per channel that were requested.
        requested: usize,
        /// Driver read timeout.
        timeout: Duration,
    },

    /// The driver-side buffer overflowed before the block was read.
    #[error("driver buffer overrun: {0}")]
    Overrun(String),

    /// The device returned a block with an unexpected shape.
    #[error("block shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch {
        /// Expected number of values.
        expected: usize,
        /// Number of values returned by the driver.
        actual: usize,
    },

    /// Any other device-reported failure.
    #[error("device error: {0}")]
    Device(String),

    /// The device is gone; no further read can succeed.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// Primary error type for the rig.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Hardware read error: {0}")]
    HardwareRead(#[from] HardwareReadError),

    #[error("Hardware configuration error: {0}")]
    HardwareConfig(String),

    #[error("Hardware write error: {0}")]
    HardwareWrite(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Camera '{camera}' did not report flushed within {waited:?}")]
    CameraTimeout { camera: String, waited: Duration },

    #[error("Session flush already performed")]
    FlushAlreadyPerformed,

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether the acquisition loop may absorb this error and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::HardwareRead(e) if !matches!(e, HardwareReadError::DeviceLost(_))
        )
    }

    /// Wraps a storage/serializer failure.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_read_errors_are_recoverable() {
        let read: DaqError = HardwareReadError::Overrun("late".into()).into();
        assert!(read.is_recoverable());
        let lost: DaqError = HardwareReadError::DeviceLost("unplugged".into()).into();
        assert!(!lost.is_recoverable());

        assert!(!DaqError::HardwareConfig("no device".into()).is_recoverable());
        assert!(!DaqError::InvalidConfiguration("bad".into()).is_recoverable());
        assert!(!DaqError::Serialization("disk full".into()).is_recoverable());
        assert!(!DaqError::FlushAlreadyPerformed.is_recoverable());
    }

    #[test]
    fn camera_timeout_names_the_camera() {
        let err = DaqError::CameraTimeout {
            camera: "cam_1".into(),
            waited: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("cam_1"));
        assert!(msg.contains("2s"));
    }

    #[test]
    fn timeout_display_includes_request() {
        let err = HardwareReadError::Timeout {
            requested: 100,
            timeout: Duration::from_millis(10),
        };
        assert!(err.to_string().contains("100 samples"));
    }
}
