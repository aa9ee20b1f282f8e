//! Simulated device drivers
//!
//! In-memory drivers with millisecond-scale motion latencies and
//! scriptable fault modes (refused connections, failing commands,
//! never-finishing slews, wedged camera processes). The orchestration
//! test suite and simulator-backed runs are built on these.

use crate::{
    CameraDriver, ConditionsSource, DomeDriver, DriverError, DriverResult, FocusDirection,
    FocuserDriver, LampDriver, ProcessHealth, ShutterStatus, TelescopeDriver,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn default_motion() -> Duration {
    Duration::from_millis(20)
}

/// Deadline-based busy flag shared by the motion simulators.
#[derive(Default)]
struct MotionState {
    busy_until: Mutex<Option<Instant>>,
    stuck: AtomicBool,
}

impl MotionState {
    fn start(&self, duration: Duration) {
        if !self.stuck.load(Ordering::SeqCst) {
            *self.busy_until.lock().unwrap() = Some(Instant::now() + duration);
        }
    }

    fn in_motion(&self) -> bool {
        if self.stuck.load(Ordering::SeqCst) {
            return true;
        }
        match *self.busy_until.lock().unwrap() {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Telescope
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TelescopeState {
    connected: AtomicBool,
    parked: AtomicBool,
    motion: MotionState,
    fail_slew: AtomicBool,
    fail_connect: AtomicBool,
    slew_count: AtomicU32,
    target: Mutex<Option<(f64, f64)>>,
    slew_ms: AtomicU64,
}

/// Test-side handle for scripting and inspecting a [`SimTelescope`].
#[derive(Clone)]
pub struct SimTelescopeControls(Arc<TelescopeState>);

impl SimTelescopeControls {
    /// Make every subsequent slew command fail at the driver level.
    pub fn fail_slews(&self, fail: bool) {
        self.0.fail_slew.store(fail, Ordering::SeqCst);
    }

    /// Make slews start but never report complete.
    pub fn stick_slews(&self, stuck: bool) {
        self.0.motion.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.0.fail_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn slew_count(&self) -> u32 {
        self.0.slew_count.load(Ordering::SeqCst)
    }

    pub fn last_target(&self) -> Option<(f64, f64)> {
        *self.0.target.lock().unwrap()
    }

    pub fn is_parked(&self) -> bool {
        self.0.parked.load(Ordering::SeqCst)
    }
}

pub struct SimTelescope {
    state: Arc<TelescopeState>,
}

impl SimTelescope {
    pub fn new() -> Self {
        let state = TelescopeState {
            parked: AtomicBool::new(true),
            slew_ms: AtomicU64::new(default_motion().as_millis() as u64),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn controls(&self) -> SimTelescopeControls {
        SimTelescopeControls(self.state.clone())
    }

    fn motion_time(&self) -> Duration {
        Duration::from_millis(self.state.slew_ms.load(Ordering::SeqCst))
    }
}

impl Default for SimTelescope {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelescopeDriver for SimTelescope {
    async fn connect(&mut self) -> DriverResult<()> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::connection("telescope", "simulated refusal"));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        if !self.state.parked.load(Ordering::SeqCst) {
            return Err(DriverError::not_safe("telescope", "mount is not parked"));
        }
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn slew(&mut self, ra_hours: f64, dec_degrees: f64) -> DriverResult<()> {
        self.state.slew_count.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_slew.load(Ordering::SeqCst) {
            return Err(DriverError::command("telescope", "simulated slew fault"));
        }
        *self.state.target.lock().unwrap() = Some((ra_hours, dec_degrees));
        self.state.parked.store(false, Ordering::SeqCst);
        self.state.motion.start(self.motion_time());
        Ok(())
    }

    async fn park(&mut self) -> DriverResult<()> {
        self.state.motion.start(self.motion_time());
        self.state.parked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unpark(&mut self) -> DriverResult<()> {
        self.state.parked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_slewing(&self) -> DriverResult<bool> {
        Ok(self.state.motion.in_motion())
    }

    async fn at_park(&self) -> DriverResult<bool> {
        Ok(self.state.parked.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Dome
// ---------------------------------------------------------------------------

struct DomeState {
    connected: AtomicBool,
    at_home: AtomicBool,
    at_park: AtomicBool,
    slaved: AtomicBool,
    motion: MotionState,
    shutter: Mutex<(ShutterStatus, Option<Instant>)>,
    shutter_ms: AtomicU64,
}

impl Default for DomeState {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            at_home: AtomicBool::new(false),
            at_park: AtomicBool::new(true),
            slaved: AtomicBool::new(false),
            motion: MotionState::default(),
            shutter: Mutex::new((ShutterStatus::Closed, None)),
            shutter_ms: AtomicU64::new(default_motion().as_millis() as u64),
        }
    }
}

impl DomeState {
    fn resolve_shutter(&self) -> ShutterStatus {
        let mut guard = self.shutter.lock().unwrap();
        if let (status, Some(deadline)) = *guard {
            if Instant::now() >= deadline {
                let settled = match status {
                    ShutterStatus::Opening => ShutterStatus::Open,
                    ShutterStatus::Closing => ShutterStatus::Closed,
                    other => other,
                };
                *guard = (settled, None);
            }
        }
        guard.0
    }
}

/// Test-side handle for scripting and inspecting a [`SimDome`].
#[derive(Clone)]
pub struct SimDomeControls(Arc<DomeState>);

impl SimDomeControls {
    pub fn shutter(&self) -> ShutterStatus {
        self.0.resolve_shutter()
    }

    pub fn is_slaved(&self) -> bool {
        self.0.slaved.load(Ordering::SeqCst)
    }

    pub fn is_parked(&self) -> bool {
        self.0.at_park.load(Ordering::SeqCst)
    }

    /// Start the simulation with the shutter already open, as after an
    /// abnormal shutdown.
    pub fn preset_shutter_open(&self) {
        *self.0.shutter.lock().unwrap() = (ShutterStatus::Open, None);
    }
}

pub struct SimDome {
    state: Arc<DomeState>,
}

impl SimDome {
    pub fn new() -> Self {
        Self {
            state: Arc::new(DomeState::default()),
        }
    }

    pub fn controls(&self) -> SimDomeControls {
        SimDomeControls(self.state.clone())
    }

    fn shutter_time(&self) -> Duration {
        Duration::from_millis(self.state.shutter_ms.load(Ordering::SeqCst))
    }
}

impl Default for SimDome {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomeDriver for SimDome {
    async fn connect(&mut self) -> DriverResult<()> {
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        let shutter = self.state.resolve_shutter();
        if shutter != ShutterStatus::Closed {
            return Err(DriverError::not_safe("dome", format!("shutter is {shutter}")));
        }
        if !self.state.at_park.load(Ordering::SeqCst) {
            return Err(DriverError::not_safe("dome", "dome is not parked"));
        }
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn find_home(&mut self) -> DriverResult<()> {
        self.state.motion.start(default_motion());
        self.state.at_home.store(true, Ordering::SeqCst);
        self.state.at_park.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn at_home(&self) -> DriverResult<bool> {
        Ok(self.state.at_home.load(Ordering::SeqCst))
    }

    async fn park(&mut self) -> DriverResult<()> {
        self.state.motion.start(default_motion());
        self.state.at_park.store(true, Ordering::SeqCst);
        self.state.at_home.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn at_park(&self) -> DriverResult<bool> {
        Ok(self.state.at_park.load(Ordering::SeqCst))
    }

    async fn is_slewing(&self) -> DriverResult<bool> {
        Ok(self.state.motion.in_motion())
    }

    async fn open_shutter(&mut self) -> DriverResult<()> {
        let deadline = Instant::now() + self.shutter_time();
        *self.state.shutter.lock().unwrap() = (ShutterStatus::Opening, Some(deadline));
        Ok(())
    }

    async fn close_shutter(&mut self) -> DriverResult<()> {
        let deadline = Instant::now() + self.shutter_time();
        *self.state.shutter.lock().unwrap() = (ShutterStatus::Closing, Some(deadline));
        Ok(())
    }

    async fn shutter_status(&self) -> DriverResult<ShutterStatus> {
        Ok(self.state.resolve_shutter())
    }

    async fn slave_to_scope(&mut self, enabled: bool) -> DriverResult<()> {
        self.state.slaved.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CameraState {
    connect_count: AtomicU32,
    expose_count: AtomicU32,
    cooler_on: AtomicBool,
    fail_expose: AtomicBool,
    settle_ms: AtomicU64,
}

/// Test-side handle shared across recreated [`SimCamera`] instances.
#[derive(Clone, Default)]
pub struct SimCameraControls(Arc<CameraState>);

impl SimCameraControls {
    pub fn connect_count(&self) -> u32 {
        self.0.connect_count.load(Ordering::SeqCst)
    }

    pub fn expose_count(&self) -> u32 {
        self.0.expose_count.load(Ordering::SeqCst)
    }

    pub fn fail_exposures(&self, fail: bool) {
        self.0.fail_expose.store(fail, Ordering::SeqCst);
    }
}

pub struct SimCamera {
    state: Arc<CameraState>,
}

impl SimCamera {
    pub fn new() -> Self {
        Self::with_controls(SimCameraControls::default())
    }

    /// Build a camera bound to an existing controls handle. Used by
    /// watchdog tests where the camera actor is torn down and rebuilt
    /// but the counters must survive.
    pub fn with_controls(controls: SimCameraControls) -> Self {
        Self { state: controls.0 }
    }

    pub fn controls(&self) -> SimCameraControls {
        SimCameraControls(self.state.clone())
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraDriver for SimCamera {
    async fn connect(&mut self) -> DriverResult<()> {
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn set_cooler(&mut self, enabled: bool) -> DriverResult<()> {
        self.state.cooler_on.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn cooler_settled(&self) -> DriverResult<bool> {
        Ok(self.state.cooler_on.load(Ordering::SeqCst))
    }

    async fn expose(
        &mut self,
        duration_secs: f64,
        _filter_position: u32,
        output: &Path,
    ) -> DriverResult<()> {
        self.state.expose_count.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_expose.load(Ordering::SeqCst) {
            return Err(DriverError::command("camera", "simulated exposure fault"));
        }
        tokio::time::sleep(Duration::from_secs_f64(duration_secs.max(0.0))).await;
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, b"SIMPLE  =                    T")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Focuser
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FocuserState {
    position: AtomicI32,
    move_count: AtomicU32,
}

/// Test-side handle for inspecting a [`SimFocuser`].
#[derive(Clone)]
pub struct SimFocuserControls(Arc<FocuserState>);

impl SimFocuserControls {
    pub fn position(&self) -> i32 {
        self.0.position.load(Ordering::SeqCst)
    }

    pub fn move_count(&self) -> u32 {
        self.0.move_count.load(Ordering::SeqCst)
    }
}

pub struct SimFocuser {
    state: Arc<FocuserState>,
}

impl SimFocuser {
    pub fn new(start_position: i32) -> Self {
        let state = FocuserState {
            position: AtomicI32::new(start_position),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn controls(&self) -> SimFocuserControls {
        SimFocuserControls(self.state.clone())
    }
}

#[async_trait]
impl FocuserDriver for SimFocuser {
    async fn connect(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn move_relative(&mut self, direction: FocusDirection, steps: u32) -> DriverResult<()> {
        self.state.move_count.fetch_add(1, Ordering::SeqCst);
        let delta = match direction {
            FocusDirection::In => -(steps as i32),
            FocusDirection::Out => steps as i32,
        };
        self.state.position.fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }

    async fn move_absolute(&mut self, position: i32) -> DriverResult<()> {
        self.state.move_count.fetch_add(1, Ordering::SeqCst);
        self.state.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> DriverResult<i32> {
        Ok(self.state.position.load(Ordering::SeqCst))
    }

    async fn halt(&mut self) -> DriverResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lamp
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LampState {
    on: AtomicBool,
}

#[derive(Clone)]
pub struct SimLampControls(Arc<LampState>);

impl SimLampControls {
    pub fn is_on(&self) -> bool {
        self.0.on.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct SimLamp {
    state: Arc<LampState>,
}

impl SimLamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> SimLampControls {
        SimLampControls(self.state.clone())
    }
}

#[async_trait]
impl LampDriver for SimLamp {
    async fn connect(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.state.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_on(&mut self) -> DriverResult<()> {
        self.state.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_off(&mut self) -> DriverResult<()> {
        self.state.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_on(&self) -> DriverResult<bool> {
        Ok(self.state.on.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Conditions and process health
// ---------------------------------------------------------------------------

/// Scriptable environmental alert source.
#[derive(Clone, Default)]
pub struct SimConditions {
    alert: Arc<AtomicBool>,
}

impl SimConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alert(&self, alert: bool) {
        self.alert.store(alert, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConditionsSource for SimConditions {
    async fn is_alert_active(&self) -> DriverResult<bool> {
        Ok(self.alert.load(Ordering::SeqCst))
    }
}

/// Scriptable process health check.
///
/// `wedge_once()` makes the next responsiveness probe fail exactly
/// once, which is how the watchdog recovery tests simulate a hung
/// camera control process.
#[derive(Clone, Default)]
pub struct SimHealth {
    wedged: Arc<AtomicBool>,
    wedge_once: Arc<AtomicBool>,
    terminate_count: Arc<AtomicU32>,
}

impl SimHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wedge(&self, wedged: bool) {
        self.wedged.store(wedged, Ordering::SeqCst);
    }

    pub fn wedge_once(&self) {
        self.wedge_once.store(true, Ordering::SeqCst);
    }

    pub fn terminate_count(&self) -> u32 {
        self.terminate_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHealth for SimHealth {
    async fn is_responsive(&self, _process: &str) -> bool {
        if self.wedge_once.swap(false, Ordering::SeqCst) {
            return false;
        }
        !self.wedged.load(Ordering::SeqCst)
    }

    async fn terminate(&self, process: &str) {
        tracing::debug!("simulated terminate of {process}");
        self.terminate_count.fetch_add(1, Ordering::SeqCst);
    }
}
