//! Telescope mount capability

use crate::DriverResult;
use async_trait::async_trait;

/// Driver interface for the telescope mount.
///
/// RA is in hours, declination in degrees, matching the ticket
/// coordinate convention.
#[async_trait]
pub trait TelescopeDriver: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    /// Disconnect from the mount. Implementations must refuse with
    /// [`DriverError::NotSafe`] when the mount is not parked.
    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Begin an asynchronous slew to the given coordinates.
    async fn slew(&mut self, ra_hours: f64, dec_degrees: f64) -> DriverResult<()>;

    async fn park(&mut self) -> DriverResult<()>;

    async fn unpark(&mut self) -> DriverResult<()>;

    /// Whether a commanded motion (slew, park) is still in progress.
    async fn is_slewing(&self) -> DriverResult<bool>;

    async fn at_park(&self) -> DriverResult<bool>;
}
