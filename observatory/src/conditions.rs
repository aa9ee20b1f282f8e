//! Environmental safety monitor
//!
//! A dedicated polling task that combines the external conditions
//! source with solar geometry and publishes a [`SafetyReading`] over
//! a watch channel on a fixed cadence. Single writer, any number of
//! readers; the controller only ever reads.

use chrono::{DateTime, Utc};
use nightwatch_drivers::{sun, ConditionsSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Snapshot of the environmental interlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyReading {
    /// Weather/rain/cloud alert from the conditions source.
    pub alert: bool,
    /// Sun at or above the geometric horizon.
    pub sun_up: bool,
}

/// Solar queries the controller and monitor depend on, behind a trait
/// so tests can script daylight.
pub trait SolarEphemeris: Send + Sync {
    fn sun_elevation(&self, now: DateTime<Utc>) -> f64;
    fn next_sunset(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Ephemeris for a fixed site.
pub struct SiteEphemeris {
    pub latitude: f64,
    pub longitude: f64,
}

impl SolarEphemeris for SiteEphemeris {
    fn sun_elevation(&self, now: DateTime<Utc>) -> f64 {
        sun::sun_elevation_degrees(now, self.latitude, self.longitude)
    }

    fn next_sunset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        sun::next_sunset_utc(now, self.latitude, self.longitude)
    }
}

/// Handle to the running monitor task.
pub struct ConditionsMonitor {
    rx: watch::Receiver<SafetyReading>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl ConditionsMonitor {
    /// Spawn the polling task. The first reading is taken immediately,
    /// then one per `cadence`.
    pub fn start(
        source: Arc<dyn ConditionsSource>,
        ephemeris: Arc<dyn SolarEphemeris>,
        cadence: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(SafetyReading::default());
        let stop = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        let stop_flag = stop.clone();
        let notify = stop_notify.clone();
        tokio::spawn(async move {
            loop {
                let reading = poll_once(source.as_ref(), ephemeris.as_ref()).await;
                if tx.send(reading).is_err() {
                    break; // nobody is listening anymore
                }
                if reading.alert || reading.sun_up {
                    tracing::warn!(
                        "conditions unsafe: alert={} sun_up={}",
                        reading.alert,
                        reading.sun_up
                    );
                } else {
                    tracing::debug!("conditions monitor is alive: last check clear");
                }

                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(cadence) => {}
                }
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
            tracing::debug!("conditions monitor stopped");
        });

        Self {
            rx,
            stop,
            stop_notify,
        }
    }

    /// Watch side used by the controller.
    pub fn subscribe(&self) -> watch::Receiver<SafetyReading> {
        self.rx.clone()
    }

    pub fn reading(&self) -> SafetyReading {
        *self.rx.borrow()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }
}

async fn poll_once(source: &dyn ConditionsSource, ephemeris: &dyn SolarEphemeris) -> SafetyReading {
    // A failed poll is treated as an alert: no data, no open shutter.
    let alert = match source.is_alert_active().await {
        Ok(alert) => alert,
        Err(e) => {
            tracing::error!("conditions source unreachable, treating as alert: {e}");
            true
        }
    };
    let sun_up = ephemeris.sun_elevation(Utc::now()) >= 0.0;
    SafetyReading { alert, sun_up }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_drivers::simulator::SimConditions;

    pub(crate) struct FixedSun {
        pub up: AtomicBool,
        pub sunset_delay: Duration,
    }

    impl SolarEphemeris for FixedSun {
        fn sun_elevation(&self, _now: DateTime<Utc>) -> f64 {
            if self.up.load(Ordering::SeqCst) {
                10.0
            } else {
                -10.0
            }
        }

        fn next_sunset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
            now + chrono::Duration::from_std(self.sunset_delay).unwrap()
        }
    }

    #[tokio::test]
    async fn test_reading_tracks_alert_flag() {
        let source = SimConditions::new();
        let ephemeris = Arc::new(FixedSun {
            up: AtomicBool::new(false),
            sunset_delay: Duration::from_secs(1),
        });
        let monitor = ConditionsMonitor::start(
            Arc::new(source.clone()),
            ephemeris,
            Duration::from_millis(5),
        );

        let mut rx = monitor.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(monitor.reading(), SafetyReading::default());

        source.set_alert(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.reading().alert);

        monitor.stop();
    }

    #[tokio::test]
    async fn test_poll_failure_counts_as_alert() {
        struct Broken;

        #[async_trait::async_trait]
        impl ConditionsSource for Broken {
            async fn is_alert_active(&self) -> nightwatch_drivers::DriverResult<bool> {
                Err(nightwatch_drivers::DriverError::command(
                    "conditions",
                    "offline",
                ))
            }
        }

        let ephemeris = Arc::new(FixedSun {
            up: AtomicBool::new(false),
            sunset_delay: Duration::from_secs(1),
        });
        let reading = poll_once(&Broken, ephemeris.as_ref()).await;
        assert!(reading.alert);
    }

    #[tokio::test]
    async fn test_sun_elevation_drives_sun_up() {
        let source = SimConditions::new();
        let ephemeris = Arc::new(FixedSun {
            up: AtomicBool::new(true),
            sunset_delay: Duration::from_secs(1),
        });
        let reading = poll_once(&source, ephemeris.as_ref()).await;
        assert!(reading.sun_up);
        assert!(!reading.alert);
    }
}
