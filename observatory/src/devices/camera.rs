//! Camera actor

use crate::actor::{Device, DeviceActor};
use crate::devices::PollPolicy;
use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::{CameraDriver, DriverResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type CameraActor = DeviceActor<Camera>;

#[derive(Debug, Default)]
pub struct CameraSignals {
    /// Level signal: set once the sensor has stabilized at its target
    /// temperature, cleared when cooling is switched off.
    pub cooler_settled: CompletionSignal,
    /// Set when an exposure concludes, successfully or not.
    pub image_done: CompletionSignal,
    /// Whether the most recent exposure actually produced a frame.
    /// A released waiter checks this instead of assuming success.
    last_exposure_ok: AtomicBool,
}

impl CameraSignals {
    pub fn last_exposure_ok(&self) -> bool {
        self.last_exposure_ok.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum CameraCommand {
    SetCooler(bool),
    Expose {
        duration_secs: f64,
        filter_position: u32,
        output: PathBuf,
    },
    Disconnect,
}

pub struct Camera {
    driver: Box<dyn CameraDriver>,
    signals: Arc<CameraSignals>,
    poll: PollPolicy,
}

impl Camera {
    pub fn new(driver: Box<dyn CameraDriver>, poll: PollPolicy) -> (Self, Arc<CameraSignals>) {
        let signals = Arc::new(CameraSignals::default());
        (
            Self {
                driver,
                signals: signals.clone(),
                poll,
            },
            signals,
        )
    }

    async fn wait_cooler_settled(&self) {
        let deadline = Instant::now() + self.poll.budget();
        loop {
            match self.driver.cooler_settled().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("camera cooler probe failed: {e}");
                    return;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!("camera cooler did not settle within the poll budget");
                return;
            }
            tokio::time::sleep(self.poll.interval()).await;
        }
    }
}

#[async_trait]
impl Device for Camera {
    type Command = CameraCommand;

    fn name(&self) -> &'static str {
        "camera"
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.driver.connect().await
    }

    async fn execute(&mut self, command: CameraCommand) {
        match command {
            CameraCommand::SetCooler(true) => {
                self.signals.cooler_settled.clear();
                match self.driver.set_cooler(true).await {
                    Ok(()) => {
                        tracing::info!("camera cooling engaged");
                        self.wait_cooler_settled().await;
                    }
                    Err(e) => tracing::error!("camera cooler on failed: {e}"),
                }
                self.signals.cooler_settled.set();
            }
            CameraCommand::SetCooler(false) => {
                if let Err(e) = self.driver.set_cooler(false).await {
                    tracing::error!("camera cooler off failed: {e}");
                }
                self.signals.cooler_settled.clear();
            }
            CameraCommand::Expose {
                duration_secs,
                filter_position,
                output,
            } => {
                self.signals.image_done.clear();
                self.signals.last_exposure_ok.store(false, Ordering::SeqCst);
                match self
                    .driver
                    .expose(duration_secs, filter_position, &output)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("exposure complete: {}", output.display());
                        self.signals.last_exposure_ok.store(true, Ordering::SeqCst);
                    }
                    Err(e) => tracing::error!("exposure failed: {e}"),
                }
                self.signals.image_done.set();
            }
            CameraCommand::Disconnect => {
                if let Err(e) = self.driver.disconnect().await {
                    tracing::error!("camera disconnect failed: {e}");
                }
            }
        }
    }
}
