//! Device driver capability layer
//!
//! Defines the async trait seams the orchestration layer depends on:
//! one capability trait per physical device, the conditions/safety
//! source, the process health check used by the camera watchdog, and
//! solar geometry. Simulator implementations live here as well so the
//! orchestration crate can be tested without hardware.

mod error;
mod telescope;
mod dome;
mod camera;
mod focuser;
mod lamp;
mod conditions;
mod health;
pub mod sun;
pub mod simulator;

pub use error::*;
pub use telescope::*;
pub use dome::*;
pub use camera::*;
pub use focuser::*;
pub use lamp::*;
pub use conditions::*;
pub use health::*;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;
