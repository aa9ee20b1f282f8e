//! Unattended observatory orchestration
//!
//! Each physical device is wrapped in an actor with a serialized
//! command queue; the observation controller coordinates them through
//! completion signals to run a night of tickets end to end: startup,
//! slewing, focusing, imaging, environmental pauses, calibration, and
//! shutdown.

pub mod actor;
pub mod calibration;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod devices;
pub mod focus;
pub mod sequence;
pub mod signals;
pub mod ticket;

pub use conditions::{ConditionsMonitor, SafetyReading, SiteEphemeris, SolarEphemeris};
pub use config::{FilterWheelConfig, ObservatoryConfig};
pub use controller::{ControllerState, DeviceSet, ObservationController, RunOptions, RunReport};
pub use ticket::{load_tickets, ObservationTicket, Target};
