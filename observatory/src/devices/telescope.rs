//! Telescope mount actor

use crate::actor::{Device, DeviceActor};
use crate::devices::PollPolicy;
use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::{DriverResult, TelescopeDriver};
use std::sync::Arc;
use std::time::Instant;

pub type TelescopeActor = DeviceActor<Telescope>;

/// Completion signals the controller waits on.
#[derive(Debug, Default)]
pub struct TelescopeSignals {
    /// Set when a slew, park, or unpark concludes.
    pub slew_done: CompletionSignal,
}

#[derive(Debug)]
pub enum TelescopeCommand {
    Slew { ra_hours: f64, dec_degrees: f64 },
    Park,
    Unpark,
    Disconnect,
}

pub struct Telescope {
    driver: Box<dyn TelescopeDriver>,
    signals: Arc<TelescopeSignals>,
    poll: PollPolicy,
}

impl Telescope {
    pub fn new(driver: Box<dyn TelescopeDriver>, poll: PollPolicy) -> (Self, Arc<TelescopeSignals>) {
        let signals = Arc::new(TelescopeSignals::default());
        (
            Self {
                driver,
                signals: signals.clone(),
                poll,
            },
            signals,
        )
    }

    /// Poll the slewing flag until the mount reports the motion done
    /// or the poll budget runs out.
    async fn finish_motion(&self, what: &str) {
        let deadline = Instant::now() + self.poll.budget();
        loop {
            match self.driver.is_slewing().await {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!("telescope status probe failed during {what}: {e}");
                    return;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!("telescope {what} did not finish within the poll budget");
                return;
            }
            tokio::time::sleep(self.poll.interval()).await;
        }
    }
}

#[async_trait]
impl Device for Telescope {
    type Command = TelescopeCommand;

    fn name(&self) -> &'static str {
        "telescope"
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.driver.connect().await
    }

    async fn execute(&mut self, command: TelescopeCommand) {
        match command {
            TelescopeCommand::Slew {
                ra_hours,
                dec_degrees,
            } => {
                self.signals.slew_done.clear();
                match self.driver.slew(ra_hours, dec_degrees).await {
                    Ok(()) => {
                        tracing::info!("telescope slewing to ra={ra_hours:.4}h dec={dec_degrees:.4}°");
                        self.finish_motion("slew").await;
                    }
                    Err(e) => tracing::error!("telescope slew failed: {e}"),
                }
                self.signals.slew_done.set();
            }
            TelescopeCommand::Park => {
                self.signals.slew_done.clear();
                match self.driver.park().await {
                    Ok(()) => {
                        tracing::info!("telescope parking");
                        self.finish_motion("park").await;
                    }
                    Err(e) => tracing::error!("telescope park failed: {e}"),
                }
                self.signals.slew_done.set();
            }
            TelescopeCommand::Unpark => {
                self.signals.slew_done.clear();
                if let Err(e) = self.driver.unpark().await {
                    tracing::error!("telescope unpark failed: {e}");
                }
                self.signals.slew_done.set();
            }
            TelescopeCommand::Disconnect => {
                if let Err(e) = self.driver.disconnect().await {
                    // NotSafe here means the mount is not parked
                    tracing::error!("telescope disconnect refused: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_drivers::simulator::SimTelescope;
    use std::time::Duration;

    fn spawn_sim() -> (TelescopeActor, Arc<TelescopeSignals>, nightwatch_drivers::simulator::SimTelescopeControls) {
        let sim = SimTelescope::new();
        let controls = sim.controls();
        let (device, signals) = Telescope::new(Box::new(sim), PollPolicy::fast());
        (DeviceActor::spawn(device), signals, controls)
    }

    #[tokio::test]
    async fn test_slew_sets_signal_after_motion_completes() {
        let (actor, signals, controls) = spawn_sim();
        actor.submit(TelescopeCommand::Slew {
            ra_hours: 12.0,
            dec_degrees: -5.0,
        });

        assert!(signals.slew_done.wait(Duration::from_secs(2)).await);
        assert_eq!(controls.last_target(), Some((12.0, -5.0)));

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_signal_set_even_when_driver_errors() {
        let (actor, signals, controls) = spawn_sim();
        controls.fail_slews(true);

        actor.submit(TelescopeCommand::Slew {
            ra_hours: 1.0,
            dec_degrees: 1.0,
        });

        // A failed command must still release the waiter
        assert!(signals.slew_done.wait(Duration::from_secs(2)).await);

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_signal_set_when_poll_budget_expires() {
        let (actor, signals, controls) = spawn_sim();
        controls.stick_slews(true);

        actor.submit(TelescopeCommand::Slew {
            ra_hours: 2.0,
            dec_degrees: 2.0,
        });

        // Budget is 2s in the fast policy; signal must fire by then
        assert!(signals.slew_done.wait(Duration::from_secs(5)).await);

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_park_then_disconnect() {
        let (actor, signals, controls) = spawn_sim();
        actor.submit(TelescopeCommand::Park);
        assert!(signals.slew_done.wait(Duration::from_secs(2)).await);
        assert!(controls.is_parked());

        actor.submit(TelescopeCommand::Disconnect);
        actor.stop();
        actor.join().await;
    }
}
