//! Error taxonomy for the irrigation control core.
//!
//! Wiring code (`main.rs`, `config.rs`, `db.rs`) stays on `anyhow`; everything
//! that runs inside a room task returns [`ControlError`] so supervisors can
//! tell a cancellation apart from a real fault.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Missing pump devices or invalid shot settings. The operation never starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every sensor reading for the room was missing or non-numeric.
    #[error("no usable sensor data for room '{0}'")]
    SensorUnavailable(String),

    /// Readings did not settle within the stabilization timeout.
    #[error("readings did not stabilize within {timeout_sec}s")]
    CalibrationTimeout { timeout_sec: u64 },

    /// A cancelled operation outlived its grace period; forced cleanup ran.
    #[error("operation {operation} ignored cancellation for {grace_ms}ms")]
    CancellationFailure { operation: u64, grace_ms: u128 },

    /// The owning operation was cancelled. Not a fault.
    #[error("operation cancelled")]
    Cancelled,

    #[error("pump command failed for device '{device}': {reason}")]
    Pump { device: String, reason: String },

    #[error("state store error: {0}")]
    Store(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    /// Errors that must be surfaced on the operator notice channel.
    pub fn is_operator_facing(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::SensorUnavailable(_) | Self::CalibrationTimeout { .. }
        )
    }
}
