//! Dome actor

use crate::actor::{Device, DeviceActor};
use crate::devices::PollPolicy;
use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::{DomeDriver, DriverResult, ShutterStatus};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub type DomeActor = DeviceActor<Dome>;

#[derive(Debug, Default)]
pub struct DomeSignals {
    /// Set when a rotation (home, park, slave engage) concludes.
    pub move_done: CompletionSignal,
    /// Set when a shutter move (or status query) concludes.
    pub shutter_done: CompletionSignal,
    /// Last shutter status observed by any shutter operation.
    shutter: Mutex<Option<ShutterStatus>>,
}

impl DomeSignals {
    pub fn last_shutter_status(&self) -> Option<ShutterStatus> {
        *self.shutter.lock().unwrap()
    }
}

#[derive(Debug)]
pub enum DomeCommand {
    FindHome,
    Park,
    OpenShutter,
    CloseShutter,
    /// Refresh the last-known shutter status without moving anything.
    /// Used at startup to capture the state left by a previous run.
    QueryShutter,
    SlaveToScope(bool),
    Disconnect,
}

pub struct Dome {
    driver: Box<dyn DomeDriver>,
    signals: Arc<DomeSignals>,
    poll: PollPolicy,
}

impl Dome {
    pub fn new(driver: Box<dyn DomeDriver>, poll: PollPolicy) -> (Self, Arc<DomeSignals>) {
        let signals = Arc::new(DomeSignals::default());
        (
            Self {
                driver,
                signals: signals.clone(),
                poll,
            },
            signals,
        )
    }

    async fn finish_rotation(&self, what: &str) {
        let deadline = Instant::now() + self.poll.budget();
        loop {
            match self.driver.is_slewing().await {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!("dome status probe failed during {what}: {e}");
                    return;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!("dome {what} did not finish within the poll budget");
                return;
            }
            tokio::time::sleep(self.poll.interval()).await;
        }
    }

    /// Shutter completion is a status-code transition, not a slewing
    /// flag: poll until the target state (or Error) is reported.
    async fn finish_shutter(&self, target: ShutterStatus) {
        let deadline = Instant::now() + self.poll.budget();
        loop {
            match self.driver.shutter_status().await {
                Ok(status) if status == target => return,
                Ok(ShutterStatus::Error) => {
                    tracing::error!("dome shutter reported an error state");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("dome shutter probe failed: {e}");
                    return;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!("dome shutter did not reach {target} within the poll budget");
                return;
            }
            tokio::time::sleep(self.poll.interval()).await;
        }
    }

    async fn record_shutter(&self) {
        match self.driver.shutter_status().await {
            Ok(status) => *self.signals.shutter.lock().unwrap() = Some(status),
            Err(e) => tracing::warn!("dome shutter query failed: {e}"),
        }
    }
}

#[async_trait]
impl Device for Dome {
    type Command = DomeCommand;

    fn name(&self) -> &'static str {
        "dome"
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.driver.connect().await
    }

    async fn execute(&mut self, command: DomeCommand) {
        match command {
            DomeCommand::FindHome => {
                self.signals.move_done.clear();
                match self.driver.find_home().await {
                    Ok(()) => {
                        tracing::info!("dome homing");
                        self.finish_rotation("homing").await;
                    }
                    Err(e) => tracing::error!("dome cannot find home: {e}"),
                }
                self.signals.move_done.set();
            }
            DomeCommand::Park => {
                self.signals.move_done.clear();
                match self.driver.park().await {
                    Ok(()) => {
                        tracing::info!("dome parking");
                        self.finish_rotation("parking").await;
                    }
                    Err(e) => tracing::error!("dome park failed: {e}"),
                }
                self.signals.move_done.set();
            }
            DomeCommand::OpenShutter => {
                self.signals.shutter_done.clear();
                match self.driver.open_shutter().await {
                    Ok(()) => {
                        tracing::info!("dome shutter opening");
                        self.finish_shutter(ShutterStatus::Open).await;
                    }
                    Err(e) => tracing::error!("dome shutter open failed: {e}"),
                }
                self.record_shutter().await;
                self.signals.shutter_done.set();
            }
            DomeCommand::CloseShutter => {
                self.signals.shutter_done.clear();
                match self.driver.close_shutter().await {
                    Ok(()) => {
                        tracing::info!("dome shutter closing");
                        self.finish_shutter(ShutterStatus::Closed).await;
                    }
                    Err(e) => tracing::error!("dome shutter close failed: {e}"),
                }
                self.record_shutter().await;
                self.signals.shutter_done.set();
            }
            DomeCommand::QueryShutter => {
                self.signals.shutter_done.clear();
                self.record_shutter().await;
                self.signals.shutter_done.set();
            }
            DomeCommand::SlaveToScope(enabled) => {
                self.signals.move_done.clear();
                match self.driver.slave_to_scope(enabled).await {
                    Ok(()) => {
                        tracing::info!(
                            "dome slaving {}",
                            if enabled { "enabled" } else { "disabled" }
                        );
                        if enabled {
                            // Engaging slaving can start a rotation
                            self.finish_rotation("slave engage").await;
                        }
                    }
                    Err(e) => tracing::error!("dome slaving toggle failed: {e}"),
                }
                self.signals.move_done.set();
            }
            DomeCommand::Disconnect => {
                if let Err(e) = self.driver.disconnect().await {
                    // Refused unless parked with the shutter closed
                    tracing::error!("dome disconnect refused: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_drivers::simulator::SimDome;
    use std::time::Duration;

    fn spawn_sim() -> (DomeActor, Arc<DomeSignals>, nightwatch_drivers::simulator::SimDomeControls) {
        let sim = SimDome::new();
        let controls = sim.controls();
        let (device, signals) = Dome::new(Box::new(sim), PollPolicy::fast());
        (DeviceActor::spawn(device), signals, controls)
    }

    #[tokio::test]
    async fn test_shutter_signal_follows_status_transition() {
        let (actor, signals, controls) = spawn_sim();

        actor.submit(DomeCommand::OpenShutter);
        assert!(signals.shutter_done.wait(Duration::from_secs(2)).await);
        assert_eq!(controls.shutter(), ShutterStatus::Open);
        assert_eq!(signals.last_shutter_status(), Some(ShutterStatus::Open));

        actor.submit(DomeCommand::CloseShutter);
        assert!(signals.shutter_done.wait(Duration::from_secs(2)).await);
        assert_eq!(controls.shutter(), ShutterStatus::Closed);

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_home_then_park_sets_move_done_each_time() {
        let (actor, signals, controls) = spawn_sim();

        actor.submit(DomeCommand::FindHome);
        assert!(signals.move_done.wait(Duration::from_secs(2)).await);

        actor.submit(DomeCommand::Park);
        assert!(signals.move_done.wait(Duration::from_secs(2)).await);
        assert!(controls.is_parked());

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_query_shutter_records_state_left_by_previous_run() {
        let (actor, signals, controls) = spawn_sim();
        controls.preset_shutter_open();

        actor.submit(DomeCommand::QueryShutter);
        assert!(signals.shutter_done.wait(Duration::from_secs(2)).await);
        assert_eq!(signals.last_shutter_status(), Some(ShutterStatus::Open));

        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_slaving_toggle() {
        let (actor, signals, controls) = spawn_sim();

        actor.submit(DomeCommand::SlaveToScope(true));
        assert!(signals.move_done.wait(Duration::from_secs(2)).await);
        assert!(controls.is_slaved());

        actor.submit(DomeCommand::SlaveToScope(false));
        assert!(signals.move_done.wait(Duration::from_secs(2)).await);
        assert!(!controls.is_slaved());

        actor.stop();
        actor.join().await;
    }
}
