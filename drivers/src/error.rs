//! Driver error types

use thiserror::Error;

/// Errors surfaced by device drivers.
///
/// Every driver call returns one of these rather than swallowing the
/// fault; the actor layer logs it and still releases any waiter.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The device connection could not be established.
    #[error("could not connect to {device}: {reason}")]
    ConnectionFailed { device: String, reason: String },

    /// A command was issued but the device rejected or failed it.
    #[error("{device} command failed: {reason}")]
    CommandFailed { device: String, reason: String },

    /// A disconnect was refused because the device is not in a safe
    /// state (telescope unparked, shutter open, lamp still on).
    #[error("{device} refused to disconnect: {reason}")]
    NotSafe { device: String, reason: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn command(device: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::CommandFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(device: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::ConnectionFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn not_safe(device: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::NotSafe {
            device: device.into(),
            reason: reason.into(),
        }
    }
}
