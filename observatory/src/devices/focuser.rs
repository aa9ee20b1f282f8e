//! Focuser actor

use crate::actor::{Device, DeviceActor};
use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::{DriverResult, FocusDirection, FocuserDriver};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub type FocuserActor = DeviceActor<Focuser>;

#[derive(Debug, Default)]
pub struct FocuserSignals {
    /// Set when a move command has been acknowledged by the driver.
    pub adjust_done: CompletionSignal,
    /// Last position reported by the driver after a move.
    position: AtomicI32,
}

impl FocuserSignals {
    pub fn position(&self) -> i32 {
        self.position.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum FocuserCommand {
    MoveRelative {
        direction: FocusDirection,
        steps: u32,
    },
    MoveAbsolute {
        position: i32,
    },
    Halt,
    Disconnect,
}

pub struct Focuser {
    driver: Box<dyn FocuserDriver>,
    signals: Arc<FocuserSignals>,
}

impl Focuser {
    pub fn new(driver: Box<dyn FocuserDriver>) -> (Self, Arc<FocuserSignals>) {
        let signals = Arc::new(FocuserSignals::default());
        (
            Self {
                driver,
                signals: signals.clone(),
            },
            signals,
        )
    }

    async fn refresh_position(&self) {
        if let Ok(position) = self.driver.position().await {
            self.signals.position.store(position, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Device for Focuser {
    type Command = FocuserCommand;

    fn name(&self) -> &'static str {
        "focuser"
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.driver.connect().await?;
        self.refresh_position().await;
        Ok(())
    }

    async fn execute(&mut self, command: FocuserCommand) {
        match command {
            FocuserCommand::MoveRelative { direction, steps } => {
                self.signals.adjust_done.clear();
                match self.driver.move_relative(direction, steps).await {
                    Ok(()) => tracing::info!("focuser moved {direction} by {steps} steps"),
                    Err(e) => tracing::error!("focuser relative move failed: {e}"),
                }
                self.refresh_position().await;
                self.signals.adjust_done.set();
            }
            FocuserCommand::MoveAbsolute { position } => {
                self.signals.adjust_done.clear();
                match self.driver.move_absolute(position).await {
                    Ok(()) => tracing::info!("focuser moved to {position}"),
                    Err(e) => tracing::error!("focuser absolute move failed: {e}"),
                }
                self.refresh_position().await;
                self.signals.adjust_done.set();
            }
            FocuserCommand::Halt => {
                if let Err(e) = self.driver.halt().await {
                    tracing::error!("focuser halt failed: {e}");
                }
            }
            FocuserCommand::Disconnect => {
                if let Err(e) = self.driver.disconnect().await {
                    tracing::error!("focuser disconnect failed: {e}");
                }
            }
        }
    }
}
