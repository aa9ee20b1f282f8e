//! Device specializations
//!
//! One module per physical device: the command enum, the completion
//! signal set shared with the controller, and the [`Device`]
//! implementation that runs on the actor's worker task.
//!
//! Every state-changing operation follows the same policy: clear the
//! associated signal, issue the driver command, log a driver error
//! instead of bailing, poll device status at a bounded interval until
//! the motion is confirmed complete (or the poll budget runs out),
//! and set the signal on the way out regardless of which of those
//! paths was taken.

pub mod telescope;
pub mod dome;
pub mod camera;
pub mod focuser;
pub mod lamp;

pub use telescope::{Telescope, TelescopeActor, TelescopeCommand, TelescopeSignals};
pub use dome::{Dome, DomeActor, DomeCommand, DomeSignals};
pub use camera::{Camera, CameraActor, CameraCommand, CameraSignals};
pub use focuser::{Focuser, FocuserActor, FocuserCommand, FocuserSignals};
pub use lamp::{Lamp, LampActor, LampCommand, LampSignals};

use crate::actor::DeviceActor;
use nightwatch_drivers::{CameraDriver, DomeDriver, FocuserDriver, LampDriver, TelescopeDriver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Bounds for the status-poll loop inside a device operation.
///
/// The budget is a liveness backstop, not a correctness knob: when it
/// runs out the operation logs the timeout and still sets its signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Seconds between status probes.
    pub interval_secs: f64,
    /// Overall budget for one operation's poll loop, in seconds.
    pub budget_secs: f64,
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.001))
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs_f64(self.budget_secs.max(self.interval_secs))
    }

    /// Fast polling for simulator-backed tests.
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            interval_secs: 0.005,
            budget_secs: 2.0,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_secs: 1.0,
            budget_secs: 180.0,
        }
    }
}

/// A spawned actor together with the signal set its operations drive.
///
/// Cloning shares the same actor; the camera rig in particular is
/// replaced wholesale by the watchdog when the control process wedges.
macro_rules! rig {
    ($rig:ident, $device:ident, $actor:ident, $signals:ident, $driver:ident) => {
        #[derive(Clone)]
        pub struct $rig {
            pub actor: Arc<$actor>,
            pub signals: Arc<$signals>,
        }

        impl $rig {
            pub fn spawn(driver: Box<dyn $driver>, poll: PollPolicy) -> Self {
                let (device, signals) = $device::new(driver, poll);
                Self {
                    actor: Arc::new(DeviceActor::spawn(device)),
                    signals,
                }
            }
        }
    };
}

rig!(TelescopeRig, Telescope, TelescopeActor, TelescopeSignals, TelescopeDriver);
rig!(DomeRig, Dome, DomeActor, DomeSignals, DomeDriver);
rig!(CameraRig, Camera, CameraActor, CameraSignals, CameraDriver);

/// Focuser and lamp operations are acknowledgment-level, so their
/// rigs take no poll policy.
#[derive(Clone)]
pub struct FocuserRig {
    pub actor: Arc<FocuserActor>,
    pub signals: Arc<FocuserSignals>,
}

impl FocuserRig {
    pub fn spawn(driver: Box<dyn FocuserDriver>) -> Self {
        let (device, signals) = Focuser::new(driver);
        Self {
            actor: Arc::new(DeviceActor::spawn(device)),
            signals,
        }
    }
}

#[derive(Clone)]
pub struct LampRig {
    pub actor: Arc<LampActor>,
    pub signals: Arc<LampSignals>,
}

impl LampRig {
    pub fn spawn(driver: Box<dyn LampDriver>) -> Self {
        let (device, signals) = Lamp::new(driver);
        Self {
            actor: Arc::new(DeviceActor::spawn(device)),
            signals,
        }
    }
}
