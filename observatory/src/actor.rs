//! Generic device actor
//!
//! Each physical device is owned by exactly one actor: a dedicated
//! tokio task that establishes the connection once, then dequeues and
//! executes one command at a time from a FIFO queue. Cross-device
//! coordination happens only in the controller, by waiting on the
//! completion signals the device operations set.

use crate::signals::CompletionSignal;
use async_trait::async_trait;
use nightwatch_drivers::DriverResult;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A device that can be driven by a [`DeviceActor`].
///
/// `execute` runs exactly one command to completion and is never
/// re-entered; it must set the command's completion signal on every
/// exit path, including driver errors and poll timeouts.
#[async_trait]
pub trait Device: Send + 'static {
    type Command: Send + std::fmt::Debug;

    fn name(&self) -> &'static str;

    async fn connect(&mut self) -> DriverResult<()>;

    async fn execute(&mut self, command: Self::Command);
}

enum Envelope<C> {
    Command(C),
    Stop,
}

/// Handle to a spawned device actor.
///
/// Submission never blocks and preserves FIFO order across callers.
/// `stop()` is cooperative: the actor finishes the command in flight
/// and exits at the next dequeue boundary.
pub struct DeviceActor<D: Device> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Envelope<D::Command>>,
    live: Arc<CompletionSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Device> DeviceActor<D> {
    /// Spawn the actor's worker task and return its handle.
    ///
    /// A failed connection is logged critical and leaves the live
    /// signal unset; the loop still drains commands so that waiters
    /// are released by the per-operation failure paths.
    pub fn spawn(device: D) -> Self {
        let name = device.name();
        let (tx, rx) = mpsc::unbounded_channel();
        let live = Arc::new(CompletionSignal::new());
        let task = tokio::spawn(run_loop(device, rx, live.clone()));
        Self {
            name,
            tx,
            live,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a command. Returns immediately; the command executes
    /// after everything submitted before it.
    pub fn submit(&self, command: D::Command) {
        if self.tx.send(Envelope::Command(command)).is_err() {
            tracing::warn!("{}: command dropped, actor has stopped", self.name);
        }
    }

    /// Signal set once the device connection is established.
    pub fn live(&self) -> &CompletionSignal {
        &self.live
    }

    /// Request graceful termination after the current command.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }

    /// Abort the worker task outright. Used by the camera watchdog
    /// when the control process is wedged and a graceful stop would
    /// never be honored.
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Wait for the worker task to finish after `stop()`.
    pub async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run_loop<D: Device>(
    mut device: D,
    mut rx: mpsc::UnboundedReceiver<Envelope<D::Command>>,
    live: Arc<CompletionSignal>,
) {
    match device.connect().await {
        Ok(()) => {
            live.set();
            tracing::info!("{} connected", device.name());
        }
        Err(e) => {
            tracing::error!("{} could not connect: {e}", device.name());
        }
    }

    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Command(command) => {
                tracing::debug!("{} executing {:?}", device.name(), command);
                device.execute(command).await;
            }
            Envelope::Stop => {
                tracing::debug!("{} actor stopping", device.name());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Probe {
        executed: Arc<Mutex<Vec<u32>>>,
        in_flight: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Device for Probe {
        type Command = u32;

        fn name(&self) -> &'static str {
            "probe"
        }

        async fn connect(&mut self) -> DriverResult<()> {
            Ok(())
        }

        async fn execute(&mut self, command: u32) {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.executed.lock().unwrap().push(command);
            self.in_flight.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_commands_execute_in_submission_order_without_overlap() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let overlapped = Arc::new(AtomicBool::new(false));
        let actor = DeviceActor::spawn(Probe {
            executed: executed.clone(),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: overlapped.clone(),
        });

        for i in 0..20 {
            actor.submit(i);
        }
        actor.stop();
        actor.join().await;

        assert_eq!(*executed.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_live_signal_set_after_connect() {
        let actor = DeviceActor::spawn(Probe {
            executed: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
        });
        assert!(actor.live().wait(Duration::from_secs(1)).await);
        actor.stop();
        actor.join().await;
    }

    struct DeadProbe;

    #[async_trait]
    impl Device for DeadProbe {
        type Command = ();

        fn name(&self) -> &'static str {
            "dead"
        }

        async fn connect(&mut self) -> DriverResult<()> {
            Err(nightwatch_drivers::DriverError::connection(
                "dead", "unplugged",
            ))
        }

        async fn execute(&mut self, _command: ()) {}
    }

    #[tokio::test]
    async fn test_live_signal_stays_unset_on_connect_failure() {
        let actor = DeviceActor::spawn(DeadProbe);
        assert!(!actor.live().wait(Duration::from_millis(50)).await);
        actor.stop();
        actor.join().await;
    }

    #[tokio::test]
    async fn test_stop_honored_at_dequeue_boundary() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let actor = DeviceActor::spawn(Probe {
            executed: executed.clone(),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
        });

        actor.submit(1);
        actor.stop();
        actor.submit(2); // enqueued after Stop, must never run
        actor.join().await;

        assert_eq!(*executed.lock().unwrap(), vec![1]);
    }
}
