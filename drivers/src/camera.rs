//! Camera capability

use crate::DriverResult;
use async_trait::async_trait;
use std::path::Path;

/// Driver interface for the imaging camera.
///
/// The driver is responsible for writing the finished frame to the
/// given output path; FITS content is outside this crate's scope.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Enable or disable sensor cooling.
    async fn set_cooler(&mut self, enabled: bool) -> DriverResult<()>;

    /// Whether the sensor has reached and stabilized at its target
    /// temperature.
    async fn cooler_settled(&self) -> DriverResult<bool>;

    /// Take one exposure through the given filter wheel position and
    /// write the frame to `output`. Returns once the frame is on disk.
    async fn expose(
        &mut self,
        duration_secs: f64,
        filter_position: u32,
        output: &Path,
    ) -> DriverResult<()>;
}
