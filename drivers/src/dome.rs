//! Dome capability

use crate::DriverResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Dome shutter state.
///
/// A partially open shutter is treated as open for safety purposes:
/// only `Closed` counts as closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterStatus {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

impl ShutterStatus {
    /// True unless the shutter is fully closed.
    pub fn counts_as_open(&self) -> bool {
        !matches!(self, ShutterStatus::Closed)
    }
}

impl std::fmt::Display for ShutterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutterStatus::Open => write!(f, "Open"),
            ShutterStatus::Closed => write!(f, "Closed"),
            ShutterStatus::Opening => write!(f, "Opening"),
            ShutterStatus::Closing => write!(f, "Closing"),
            ShutterStatus::Error => write!(f, "Error"),
        }
    }
}

/// Driver interface for the dome.
#[async_trait]
pub trait DomeDriver: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    /// Disconnect from the dome. Implementations must refuse with
    /// [`DriverError::NotSafe`] unless the dome is parked and the
    /// shutter is fully closed.
    async fn disconnect(&mut self) -> DriverResult<()>;

    async fn find_home(&mut self) -> DriverResult<()>;

    async fn at_home(&self) -> DriverResult<bool>;

    async fn park(&mut self) -> DriverResult<()>;

    async fn at_park(&self) -> DriverResult<bool>;

    /// Whether the dome is rotating.
    async fn is_slewing(&self) -> DriverResult<bool>;

    async fn open_shutter(&mut self) -> DriverResult<()>;

    async fn close_shutter(&mut self) -> DriverResult<()>;

    async fn shutter_status(&self) -> DriverResult<ShutterStatus>;

    /// Enable or disable slaving dome azimuth to the telescope.
    async fn slave_to_scope(&mut self, enabled: bool) -> DriverResult<()>;
}
