//! Flat-field calibration lamp capability

use crate::DriverResult;
use async_trait::async_trait;

/// Driver interface for the flat-field lamp.
#[async_trait]
pub trait LampDriver: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    /// Disconnect from the lamp, turning it off first if needed.
    async fn disconnect(&mut self) -> DriverResult<()>;

    async fn turn_on(&mut self) -> DriverResult<()>;

    async fn turn_off(&mut self) -> DriverResult<()>;

    async fn is_on(&self) -> DriverResult<bool>;
}
