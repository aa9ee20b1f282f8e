//! Flat-field lamp actor

use crate::actor::{Device, DeviceActor};
use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::{DriverResult, LampDriver};
use std::sync::Arc;

pub type LampActor = DeviceActor<Lamp>;

#[derive(Debug, Default)]
pub struct LampSignals {
    /// Set when a lamp switch command concludes.
    pub lamp_done: CompletionSignal,
}

#[derive(Debug)]
pub enum LampCommand {
    TurnOn,
    TurnOff,
    Disconnect,
}

pub struct Lamp {
    driver: Box<dyn LampDriver>,
    signals: Arc<LampSignals>,
}

impl Lamp {
    pub fn new(driver: Box<dyn LampDriver>) -> (Self, Arc<LampSignals>) {
        let signals = Arc::new(LampSignals::default());
        (
            Self {
                driver,
                signals: signals.clone(),
            },
            signals,
        )
    }
}

#[async_trait]
impl Device for Lamp {
    type Command = LampCommand;

    fn name(&self) -> &'static str {
        "flat lamp"
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.driver.connect().await
    }

    async fn execute(&mut self, command: LampCommand) {
        match command {
            LampCommand::TurnOn => {
                self.signals.lamp_done.clear();
                match self.driver.turn_on().await {
                    Ok(()) => tracing::info!("flat lamp on"),
                    Err(e) => tracing::error!("flat lamp on failed: {e}"),
                }
                self.signals.lamp_done.set();
            }
            LampCommand::TurnOff => {
                self.signals.lamp_done.clear();
                match self.driver.turn_off().await {
                    Ok(()) => tracing::info!("flat lamp off"),
                    Err(e) => tracing::error!("flat lamp off failed: {e}"),
                }
                self.signals.lamp_done.set();
            }
            LampCommand::Disconnect => {
                if let Err(e) = self.driver.disconnect().await {
                    tracing::error!("flat lamp disconnect failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_drivers::simulator::SimLamp;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lamp_switching() {
        let sim = SimLamp::new();
        let controls = sim.controls();
        let (device, signals) = Lamp::new(Box::new(sim));
        let actor = DeviceActor::spawn(device);

        actor.submit(LampCommand::TurnOn);
        assert!(signals.lamp_done.wait(Duration::from_secs(2)).await);
        assert!(controls.is_on());

        actor.submit(LampCommand::TurnOff);
        assert!(signals.lamp_done.wait(Duration::from_secs(2)).await);
        assert!(!controls.is_on());

        actor.stop();
        actor.join().await;
    }
}
