//! Observation controller
//!
//! The one task that coordinates every device actor through a night:
//! startup, per-ticket slewing and imaging, environmental pauses,
//! calibration, and shutdown. It owns no device; it submits commands
//! to the actors and waits on their completion signals, so a stuck
//! device can never wedge the controller past its own timeouts.

use crate::calibration::take_calibration_frames;
use crate::conditions::{SafetyReading, SolarEphemeris};
use crate::config::{FilterWheelConfig, ObservatoryConfig};
use crate::devices::{
    CameraCommand, CameraRig, DomeCommand, DomeRig, FocuserRig, LampRig, TelescopeCommand,
    TelescopeRig,
};
use crate::focus::FocusController;
use crate::sequence::ImageSequenceCounter;
use crate::signals::CompletionSignal;
use crate::ticket::{ObservationTicket, Target};
use chrono::Utc;
use nightwatch_drivers::ProcessHealth;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;

/// Where the run currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Starting,
    Observing,
    Paused,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Idle => "idle",
            ControllerState::Starting => "starting",
            ControllerState::Observing => "observing",
            ControllerState::Paused => "paused",
            ControllerState::ShuttingDown => "shutting down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// CLI-level switches for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_shutdown: bool,
    pub skip_calibration: bool,
    pub skip_initial_focus: bool,
}

/// What the night produced.
#[derive(Debug, Default)]
pub struct RunReport {
    pub tickets_attempted: usize,
    pub frames_requested: u32,
    pub frames_taken: u32,
    pub calibration_frames: u32,
    pub aborted: bool,
}

/// The five spawned device handles the controller coordinates.
pub struct DeviceSet {
    pub telescope: TelescopeRig,
    pub dome: DomeRig,
    pub camera: CameraRig,
    pub focuser: FocuserRig,
    pub lamp: LampRig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Clear,
    Alert,
    SunUp,
    DeviceDown,
}

enum ImagingOutcome {
    /// Plan ran to the end (or was truncated past the window).
    Done { taken: u32 },
    /// Conditions turned mid-loop; `attempted` is the plan cursor to
    /// resume from after the pause.
    Interrupted {
        attempted: usize,
        taken: u32,
        verdict: Verdict,
    },
    /// Exposure timed out with a responsive camera process: abort the
    /// remainder of this ticket.
    Aborted { taken: u32 },
}

enum TicketFlow {
    Continue,
    AbortRun,
}

struct MaintenancePlan {
    baseline_fwhm: f64,
    filter_position: u32,
    out_dir: PathBuf,
}

/// Builds a replacement camera rig after a watchdog recovery.
pub type CameraFactory = Box<dyn Fn() -> CameraRig + Send + Sync>;

pub struct ObservationController {
    config: ObservatoryConfig,
    wheel: FilterWheelConfig,
    options: RunOptions,
    telescope: TelescopeRig,
    dome: DomeRig,
    camera: CameraRig,
    focuser: FocuserRig,
    lamp: LampRig,
    camera_factory: CameraFactory,
    health: Arc<dyn ProcessHealth>,
    safety: watch::Receiver<SafetyReading>,
    ephemeris: Arc<dyn SolarEphemeris>,
    focus: Arc<FocusController>,
    state_tx: watch::Sender<ControllerState>,
    initial_shutter_open: bool,
    camera_crashed: bool,
    maintenance: Option<MaintenancePlan>,
    focused_once: bool,
    confirmed_once: bool,
}

impl ObservationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ObservatoryConfig,
        wheel: FilterWheelConfig,
        devices: DeviceSet,
        camera_factory: CameraFactory,
        health: Arc<dyn ProcessHealth>,
        safety: watch::Receiver<SafetyReading>,
        ephemeris: Arc<dyn SolarEphemeris>,
        focus: Arc<FocusController>,
        options: RunOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            config,
            wheel,
            options,
            telescope: devices.telescope,
            dome: devices.dome,
            camera: devices.camera,
            focuser: devices.focuser,
            lamp: devices.lamp,
            camera_factory,
            health,
            safety,
            ephemeris,
            focus,
            state_tx,
            initial_shutter_open: false,
            camera_crashed: false,
            maintenance: None,
            focused_once: false,
            confirmed_once: false,
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Whether a camera recovery is in progress.
    pub fn camera_crashed(&self) -> bool {
        self.camera_crashed
    }

    fn set_state(&self, state: ControllerState) {
        if self.state() != state {
            tracing::info!("run state: {state}");
            self.state_tx.send_replace(state);
        }
    }

    /// Run the whole night: startup, every ticket in order, calibration
    /// frames, shutdown. Always returns a report, even on abort.
    pub async fn observe(&mut self, tickets: &[ObservationTicket]) -> RunReport {
        let mut report = RunReport::default();

        if !self.startup_procedure().await {
            tracing::error!("startup did not pass the safety check, shutting down");
            report.aborted = true;
            self.finish(&mut report, tickets).await;
            return report;
        }

        for ticket in tickets {
            report.tickets_attempted += 1;
            self.set_state(ControllerState::Observing);
            tracing::info!("starting ticket '{}'", ticket.name);
            match self.run_ticket(ticket, &mut report).await {
                TicketFlow::Continue => {}
                TicketFlow::AbortRun => {
                    tracing::error!("aborting the remaining ticket list");
                    report.aborted = true;
                    break;
                }
            }
        }

        self.finish(&mut report, tickets).await;
        report
    }

    async fn finish(&mut self, report: &mut RunReport, tickets: &[ObservationTicket]) {
        if !self.options.skip_calibration && !report.aborted && report.frames_taken > 0 {
            report.calibration_frames = self.run_calibration(tickets).await;
        }

        if self.options.skip_shutdown {
            tracing::warn!("shutdown skipped by request, devices left as they are");
            self.focus.stop_maintenance();
            self.set_state(ControllerState::Stopped);
        } else {
            self.shutdown_procedure().await;
        }

        tracing::info!(
            "run complete: {}/{} frames across {} ticket(s)",
            report.frames_taken,
            report.frames_requested,
            report.tickets_attempted
        );
    }

    // -- startup ----------------------------------------------------------

    /// Bring the observatory to an observing-ready state. Returns false
    /// when the safety check fails and the run must not proceed.
    async fn startup_procedure(&mut self) -> bool {
        self.set_state(ControllerState::Starting);

        // Capture the shutter state a previous run may have left behind
        self.dome.signals.shutter_done.clear();
        self.dome.actor.submit(DomeCommand::QueryShutter);
        self.wait_done(
            &self.dome.signals.shutter_done,
            self.config.live_timeout(),
            "shutter query",
        )
        .await;
        self.initial_shutter_open = self
            .dome
            .signals
            .last_shutter_status()
            .map(|status| status.counts_as_open())
            .unwrap_or(false);
        if self.initial_shutter_open {
            tracing::warn!("dome shutter was already open at startup");
        }

        if self.everything_ok().await != Verdict::Clear {
            return false;
        }

        self.camera.actor.submit(CameraCommand::SetCooler(true));

        if !self.initial_shutter_open {
            self.dome.signals.shutter_done.clear();
            self.dome.signals.move_done.clear();
            self.telescope.signals.slew_done.clear();
            self.dome.actor.submit(DomeCommand::OpenShutter);
            self.dome.actor.submit(DomeCommand::FindHome);
            self.telescope.actor.submit(TelescopeCommand::Unpark);

            let bound = self.config.poll.budget() + Duration::from_secs(5);
            self.wait_done(&self.dome.signals.shutter_done, bound, "shutter open")
                .await;
            self.wait_done(&self.dome.signals.move_done, bound, "dome homing")
                .await;
            self.wait_done(&self.telescope.signals.slew_done, bound, "unpark")
                .await;
        }

        self.dome.signals.move_done.clear();
        self.dome.actor.submit(DomeCommand::SlaveToScope(true));
        self.wait_done(
            &self.dome.signals.move_done,
            self.config.poll.budget(),
            "dome slaving",
        )
        .await;

        true
    }

    // -- safety -----------------------------------------------------------

    /// Short-circuit check of every actor's live signal plus the latest
    /// conditions reading.
    async fn everything_ok(&self) -> Verdict {
        let bound = self.config.live_timeout();
        let actors: [(&str, &CompletionSignal); 5] = [
            ("telescope", self.telescope.actor.live()),
            ("dome", self.dome.actor.live()),
            ("camera", self.camera.actor.live()),
            ("focuser", self.focuser.actor.live()),
            ("flat lamp", self.lamp.actor.live()),
        ];
        for (name, live) in actors {
            if !live.wait(bound).await {
                tracing::error!("{name} is not live, failing the safety check");
                return Verdict::DeviceDown;
            }
        }

        let reading = *self.safety.borrow();
        if reading.alert {
            return Verdict::Alert;
        }
        if reading.sun_up {
            return Verdict::SunUp;
        }
        Verdict::Clear
    }

    // -- per-ticket flow --------------------------------------------------

    async fn run_ticket(&mut self, ticket: &ObservationTicket, report: &mut RunReport) -> TicketFlow {
        let out_dir = self.config.data_directory.join(&ticket.name);
        if let Err(e) = std::fs::create_dir_all(&out_dir) {
            tracing::error!("cannot create {}: {e}, skipping ticket", out_dir.display());
            return TicketFlow::Continue;
        }

        // Expand the exposure plan up front: round-robin when cycling,
        // otherwise one full block of `count` per filter.
        let plan: Vec<String> = if ticket.cycle_filter {
            (0..ticket.count)
                .map(|i| ticket.filters[i as usize % ticket.filters.len()].clone())
                .collect()
        } else {
            ticket
                .filters
                .iter()
                .flat_map(|f| vec![f.clone(); ticket.count as usize])
                .collect()
        };

        let mut counter = ImageSequenceCounter::new();
        for filter in &ticket.filters {
            counter.seed_from_dir(&out_dir, &ticket.name, ticket.exposure_secs, filter);
        }

        for target in &ticket.targets {
            let mut cursor = 0usize;
            let mut taken = 0u32;
            loop {
                match self.everything_ok().await {
                    Verdict::Clear => {}
                    Verdict::DeviceDown => return TicketFlow::AbortRun,
                    verdict => {
                        self.pause_until_safe(verdict).await;
                        continue;
                    }
                }

                if !self.slew_with_retry(target).await {
                    report.frames_taken += taken;
                    report.frames_requested += plan.len() as u32;
                    return TicketFlow::AbortRun;
                }

                self.wait_for_window(ticket).await;
                self.wait_done(
                    &self.camera.signals.cooler_settled,
                    self.config.poll.budget(),
                    "cooler settling",
                )
                .await;

                match self.everything_ok().await {
                    Verdict::Clear => {}
                    Verdict::DeviceDown => {
                        report.frames_taken += taken;
                        report.frames_requested += plan.len() as u32;
                        return TicketFlow::AbortRun;
                    }
                    verdict => {
                        self.pause_until_safe(verdict).await;
                        continue;
                    }
                }

                if !self.focused_once && !self.options.skip_initial_focus {
                    self.run_initial_focus(ticket, &out_dir).await;
                }
                self.confirm_checkpoint().await;

                match self
                    .take_images(ticket, &plan, &out_dir, &mut counter, cursor)
                    .await
                {
                    ImagingOutcome::Done { taken: n } => {
                        taken += n;
                        break;
                    }
                    ImagingOutcome::Aborted { taken: n } => {
                        taken += n;
                        tracing::error!("ticket '{}' aborted mid-imaging", ticket.name);
                        break;
                    }
                    ImagingOutcome::Interrupted {
                        attempted,
                        taken: n,
                        verdict,
                    } => {
                        cursor = attempted;
                        taken += n;
                        match verdict {
                            Verdict::DeviceDown => {
                                report.frames_taken += taken;
                                report.frames_requested += plan.len() as u32;
                                return TicketFlow::AbortRun;
                            }
                            verdict => self.pause_until_safe(verdict).await,
                        }
                    }
                }
            }

            tracing::info!(
                "target ra={:.4}h dec={:.4}° done: {}/{} frame(s)",
                target.ra_hours,
                target.dec_degrees,
                taken,
                plan.len()
            );
            report.frames_taken += taken;
            report.frames_requested += plan.len() as u32;
        }

        TicketFlow::Continue
    }

    /// Bounded slew wait with exactly one retry. A second timeout is
    /// fatal for the whole run.
    async fn slew_with_retry(&self, target: &Target) -> bool {
        for attempt in 1..=2 {
            self.telescope.signals.slew_done.clear();
            self.telescope.actor.submit(TelescopeCommand::Slew {
                ra_hours: target.ra_hours,
                dec_degrees: target.dec_degrees,
            });
            if self
                .telescope
                .signals
                .slew_done
                .wait(self.config.slew_timeout())
                .await
            {
                return true;
            }
            tracing::error!(
                "slew to ra={:.4}h dec={:.4}° timed out (attempt {attempt})",
                target.ra_hours,
                target.dec_degrees
            );
            // Drain the in-flight command so the retry cannot be
            // released by the previous attempt's late signal.
            if !self
                .telescope
                .signals
                .slew_done
                .wait(self.config.poll.budget() + Duration::from_secs(1))
                .await
            {
                tracing::error!("telescope actor is unresponsive");
                return false;
            }
        }
        false
    }

    async fn wait_for_window(&self, ticket: &ObservationTicket) {
        let start = ticket.start_time.with_timezone(&Utc);
        let now = Utc::now();
        if start > now {
            let wait = (start - now).to_std().unwrap_or_default();
            tracing::info!(
                "ticket '{}' starts at {}, waiting {}s",
                ticket.name,
                ticket.start_time,
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn run_initial_focus(&mut self, ticket: &ObservationTicket, out_dir: &Path) {
        self.focused_once = true;
        let filter_position = self.wheel.position_for(&ticket.filters[0]);
        match self
            .focus
            .run_initial_focus(&self.camera, filter_position, out_dir)
            .await
        {
            Ok(baseline_fwhm) => {
                self.maintenance = Some(MaintenancePlan {
                    baseline_fwhm,
                    filter_position,
                    out_dir: out_dir.to_path_buf(),
                });
                self.restart_maintenance();
            }
            Err(e) => tracing::error!("initial focus failed, observing as-is: {e}"),
        }
    }

    fn restart_maintenance(&self) {
        if let Some(plan) = &self.maintenance {
            self.focus.start_maintenance(
                self.camera.clone(),
                plan.baseline_fwhm,
                plan.filter_position,
                plan.out_dir.clone(),
            );
        }
    }

    /// Optional operator hold before the first science frame.
    async fn confirm_checkpoint(&mut self) {
        if self.confirmed_once || !self.config.confirm_before_imaging {
            return;
        }
        self.confirmed_once = true;
        tracing::warn!("ready to image, press Enter to continue");
        let mut line = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        let _ = reader.read_line(&mut line).await;
    }

    // -- imaging ----------------------------------------------------------

    async fn take_images(
        &mut self,
        ticket: &ObservationTicket,
        plan: &[String],
        out_dir: &Path,
        counter: &mut ImageSequenceCounter,
        start: usize,
    ) -> ImagingOutcome {
        let end = ticket.end_time.with_timezone(&Utc);
        let mut taken = 0u32;

        for (cursor, filter) in plan.iter().enumerate().skip(start) {
            if Utc::now() >= end {
                tracing::warn!(
                    "ticket '{}' ran past its end time, truncating at {} of {} frame(s)",
                    ticket.name,
                    cursor,
                    plan.len()
                );
                return ImagingOutcome::Done { taken };
            }

            match self.everything_ok().await {
                Verdict::Clear => {}
                verdict => {
                    return ImagingOutcome::Interrupted {
                        attempted: cursor,
                        taken,
                        verdict,
                    }
                }
            }

            let position = self.wheel.position_for(filter);
            let frame = counter.advance(out_dir, &ticket.name, ticket.exposure_secs, filter);

            // Retried with the same path when the camera process wedges
            loop {
                self.camera.signals.image_done.clear();
                self.camera.actor.submit(CameraCommand::Expose {
                    duration_secs: ticket.exposure_secs,
                    filter_position: position,
                    output: frame.clone(),
                });
                let finished = self
                    .camera
                    .signals
                    .image_done
                    .wait(self.config.exposure_wait(ticket.exposure_secs))
                    .await;

                if !self
                    .health
                    .is_responsive(&self.config.camera_process)
                    .await
                {
                    self.recover_camera().await;
                    continue;
                }

                if !finished {
                    tracing::error!("exposure {} timed out", frame.display());
                    return ImagingOutcome::Aborted { taken };
                }
                if self.camera.signals.last_exposure_ok() {
                    taken += 1;
                } else {
                    tracing::error!("exposure {} failed, moving on", frame.display());
                }
                break;
            }
        }

        ImagingOutcome::Done { taken }
    }

    /// Camera watchdog recovery: terminate the wedged control process,
    /// abort the old actor, and spawn a fresh one from the factory.
    async fn recover_camera(&mut self) {
        self.camera_crashed = true;
        tracing::error!(
            "camera process '{}' is unresponsive, recovering",
            self.config.camera_process
        );
        tokio::time::sleep(self.config.crash_recovery_wait()).await;
        self.health.terminate(&self.config.camera_process).await;
        self.camera.actor.abort();

        self.camera = (self.camera_factory)();
        if !self
            .camera
            .actor
            .live()
            .wait(self.config.live_timeout())
            .await
        {
            tracing::error!("recreated camera did not come up in time");
        }
        self.camera.actor.submit(CameraCommand::SetCooler(true));
        self.restart_maintenance();
        self.camera_crashed = false;
    }

    // -- pause / resume ---------------------------------------------------

    /// Secure the observatory, wait out the alert or the daylight, then
    /// bring everything back up. The caller re-slews and resumes the
    /// same ticket.
    async fn pause_until_safe(&mut self, verdict: Verdict) {
        self.set_state(ControllerState::Paused);
        tracing::warn!("pausing the run: {verdict:?}");
        self.focus.stop_maintenance();
        self.secure_motions().await;

        if verdict == Verdict::SunUp {
            let sunset = self.ephemeris.next_sunset(Utc::now());
            let wait = (sunset - Utc::now()).to_std().unwrap_or_default();
            tracing::info!("sleeping until sunset at {sunset} ({}s)", wait.as_secs());
            tokio::time::sleep(wait).await;
        }

        let cadence = self.config.weather_cadence();
        let mut rx = self.safety.clone();
        loop {
            let reading = *rx.borrow();
            if !reading.alert && !reading.sun_up {
                if self.startup_procedure().await {
                    break;
                }
            }
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep(cadence) => {}
            }
        }

        self.restart_maintenance();
        self.set_state(ControllerState::Observing);
    }

    // -- calibration and shutdown ----------------------------------------

    async fn run_calibration(&mut self, tickets: &[ObservationTicket]) -> u32 {
        let mut filters: Vec<String> = Vec::new();
        let mut exposures: Vec<f64> = Vec::new();
        for ticket in tickets {
            for filter in &ticket.filters {
                if !filters.contains(filter) {
                    filters.push(filter.clone());
                }
            }
            exposures.push(ticket.exposure_secs);
        }
        if filters.is_empty() {
            return 0;
        }

        let out_dir = self.config.data_directory.join("calibration");
        if let Err(e) = std::fs::create_dir_all(&out_dir) {
            tracing::error!("cannot create {}: {e}, skipping calibration", out_dir.display());
            return 0;
        }

        tracing::info!("taking calibration frames");
        take_calibration_frames(
            &self.camera,
            &self.lamp,
            &self.wheel,
            &self.config.calibration,
            &filters,
            &exposures,
            &out_dir,
        )
        .await
    }

    /// Park and close everything without stopping the actor loops.
    async fn secure_motions(&self) {
        let bound = self.config.poll.budget() + Duration::from_secs(5);

        self.dome.signals.move_done.clear();
        self.dome.actor.submit(DomeCommand::SlaveToScope(false));
        self.wait_done(&self.dome.signals.move_done, bound, "dome unslaving")
            .await;

        self.telescope.signals.slew_done.clear();
        self.dome.signals.move_done.clear();
        self.dome.signals.shutter_done.clear();
        self.telescope.actor.submit(TelescopeCommand::Park);
        self.dome.actor.submit(DomeCommand::Park);
        self.dome.actor.submit(DomeCommand::CloseShutter);

        self.wait_done(&self.telescope.signals.slew_done, bound, "telescope park")
            .await;
        self.wait_done(&self.dome.signals.move_done, bound, "dome park")
            .await;
        self.wait_done(&self.dome.signals.shutter_done, bound, "shutter close")
            .await;
    }

    async fn shutdown_procedure(&mut self) {
        self.set_state(ControllerState::ShuttingDown);
        self.focus.stop_maintenance();
        self.secure_motions().await;

        self.camera.actor.submit(CameraCommand::SetCooler(false));
        self.telescope.actor.submit(TelescopeCommand::Disconnect);
        self.dome.actor.submit(DomeCommand::Disconnect);
        self.camera.actor.submit(CameraCommand::Disconnect);
        self.focuser
            .actor
            .submit(crate::devices::FocuserCommand::Disconnect);
        self.lamp
            .actor
            .submit(crate::devices::LampCommand::Disconnect);

        if self.config.stop_threads_on_shutdown {
            self.telescope.actor.stop();
            self.dome.actor.stop();
            self.camera.actor.stop();
            self.focuser.actor.stop();
            self.lamp.actor.stop();
            self.telescope.actor.join().await;
            self.dome.actor.join().await;
            self.camera.actor.join().await;
            self.focuser.actor.join().await;
            self.lamp.actor.join().await;
        }

        self.set_state(ControllerState::Stopped);
    }

    async fn wait_done(&self, signal: &CompletionSignal, bound: Duration, what: &str) {
        if !signal.wait(bound).await {
            tracing::warn!("{what} did not signal completion within {}s", bound.as_secs());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationConfig, FocusConfig};
    use crate::devices::PollPolicy;
    use crate::focus::SimulatedFocusMetric;
    use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
    use nightwatch_drivers::simulator::{
        SimCamera, SimCameraControls, SimDome, SimDomeControls, SimFocuser, SimHealth, SimLamp,
        SimLampControls, SimTelescope, SimTelescopeControls,
    };
    use tempfile::TempDir;

    struct TestSun {
        sunset_delay: Duration,
    }

    impl SolarEphemeris for TestSun {
        fn sun_elevation(&self, _now: DateTime<Utc>) -> f64 {
            -10.0
        }

        fn next_sunset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
            now + ChronoDuration::from_std(self.sunset_delay).unwrap()
        }
    }

    fn fast_config(data_dir: &Path) -> ObservatoryConfig {
        ObservatoryConfig {
            data_directory: data_dir.to_path_buf(),
            weather_freq_minutes: 0.0005, // 30ms cadence in pause loops
            slew_timeout_secs: 0.1,
            live_timeout_secs: 0.2,
            exposure_grace_secs: 0.5,
            poll: PollPolicy {
                interval_secs: 0.005,
                budget_secs: 0.3,
            },
            crash_recovery_wait_secs: 0.01,
            calibration: CalibrationConfig {
                flat_count: 1,
                flat_exposure_secs: 0.01,
                dark_count: 1,
            },
            focus: FocusConfig {
                probe_exposure_secs: 0.01,
                initial_step: 100,
                min_step: 10,
                target_fwhm: 2.1,
                tolerance_fwhm: 0.5,
                maintenance_interval_secs: 600.0,
                max_iterations: 10,
            },
            ..Default::default()
        }
    }

    struct Harness {
        controller: ObservationController,
        scope: SimTelescopeControls,
        dome: SimDomeControls,
        camera: SimCameraControls,
        lamp: SimLampControls,
        health: SimHealth,
        safety_tx: watch::Sender<SafetyReading>,
        _data: TempDir,
    }

    fn build(options: RunOptions, sunset_delay: Duration) -> Harness {
        let data = TempDir::new().unwrap();
        let config = fast_config(data.path());
        let poll = config.poll;

        let scope_sim = SimTelescope::new();
        let scope = scope_sim.controls();
        let dome_sim = SimDome::new();
        let dome = dome_sim.controls();
        let camera_controls = SimCameraControls::default();
        let lamp_sim = SimLamp::new();
        let lamp = lamp_sim.controls();
        let focuser_sim = SimFocuser::new(5000);
        let focuser_controls = focuser_sim.controls();
        let health = SimHealth::new();
        let (safety_tx, safety_rx) = watch::channel(SafetyReading::default());

        let telescope = TelescopeRig::spawn(Box::new(scope_sim), poll);
        let dome_rig = DomeRig::spawn(Box::new(dome_sim), poll);
        let camera =
            CameraRig::spawn(Box::new(SimCamera::with_controls(camera_controls.clone())), poll);
        let focuser = FocuserRig::spawn(Box::new(focuser_sim));
        let lamp_rig = LampRig::spawn(Box::new(lamp_sim));

        let metric = Arc::new(SimulatedFocusMetric::new(focuser_controls, 4900, 2.0, 0.01));
        let focus = Arc::new(FocusController::new(
            focuser.clone(),
            metric,
            config.focus.clone(),
        ));

        let factory_controls = camera_controls.clone();
        let camera_factory: CameraFactory = Box::new(move || {
            CameraRig::spawn(
                Box::new(SimCamera::with_controls(factory_controls.clone())),
                poll,
            )
        });

        let controller = ObservationController::new(
            config,
            FilterWheelConfig::default(),
            DeviceSet {
                telescope,
                dome: dome_rig,
                camera,
                focuser,
                lamp: lamp_rig,
            },
            camera_factory,
            Arc::new(health.clone()),
            safety_rx,
            Arc::new(TestSun { sunset_delay }),
            focus,
            options,
        );

        Harness {
            controller,
            scope,
            dome,
            camera: camera_controls,
            lamp,
            health,
            safety_tx,
            _data: data,
        }
    }

    fn ticket_with_exp(
        name: &str,
        count: u32,
        filters: &[&str],
        cycle: bool,
        exposure: f64,
    ) -> ObservationTicket {
        let now = Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap());
        serde_json::from_value(serde_json::json!({
            "name": name,
            "ra": 12.5,
            "dec": 40.0,
            "start_time": (now - ChronoDuration::hours(1)).to_rfc3339(),
            "end_time": (now + ChronoDuration::hours(4)).to_rfc3339(),
            "exp_time": exposure,
            "filter": filters,
            "num": count,
            "cycle_filter": cycle,
        }))
        .unwrap()
    }

    fn ticket(name: &str, count: u32, filters: &[&str], cycle: bool) -> ObservationTicket {
        ticket_with_exp(name, count, filters, cycle, 0.01)
    }

    fn quiet_options() -> RunOptions {
        RunOptions {
            skip_shutdown: false,
            skip_calibration: true,
            skip_initial_focus: true,
        }
    }

    #[tokio::test]
    async fn test_nominal_run_cycles_filters_and_shuts_down() {
        let mut h = build(quiet_options(), Duration::from_millis(50));
        let tickets = vec![ticket("M31", 6, &["R", "G"], true)];

        let report = h.controller.observe(&tickets).await;

        assert!(!report.aborted);
        assert_eq!(report.frames_taken, 6);
        assert_eq!(report.frames_requested, 6);
        assert_eq!(h.controller.state(), ControllerState::Stopped);

        let dir = h._data.path().join("M31");
        for index in 1..=3 {
            assert!(dir.join(format!("M31_0.01s_R-{index:04}.fits")).exists());
            assert!(dir.join(format!("M31_0.01s_G-{index:04}.fits")).exists());
        }
        assert!(h.scope.is_parked());
        assert!(h.dome.is_parked());
        assert!(!h.dome.is_slaved());
        assert_eq!(
            h.dome.shutter(),
            nightwatch_drivers::ShutterStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_stuck_slew_gets_exactly_one_retry_then_aborts() {
        let mut h = build(quiet_options(), Duration::from_millis(50));
        h.scope.stick_slews(true);
        let tickets = vec![
            ticket("A", 2, &["R"], false),
            ticket("B", 2, &["R"], false),
        ];

        let report = h.controller.observe(&tickets).await;

        assert!(report.aborted);
        assert_eq!(report.frames_taken, 0);
        // Original slew plus one retry, and ticket B never slews
        assert_eq!(h.scope.slew_count(), 2);
        assert_eq!(report.tickets_attempted, 1);
    }

    #[tokio::test]
    async fn test_numbering_resumes_after_a_crash() {
        let mut h = build(quiet_options(), Duration::from_millis(50));
        let dir = h._data.path().join("M31");
        std::fs::create_dir_all(&dir).unwrap();
        for index in 1..=5 {
            std::fs::write(dir.join(format!("M31_0.01s_R-{index:04}.fits")), b"").unwrap();
        }
        let tickets = vec![ticket("M31", 2, &["R"], false)];

        let report = h.controller.observe(&tickets).await;

        assert_eq!(report.frames_taken, 2);
        assert!(dir.join("M31_0.01s_R-0006.fits").exists());
        assert!(dir.join("M31_0.01s_R-0007.fits").exists());
    }

    #[tokio::test]
    async fn test_dead_device_fails_the_safety_check() {
        let data = TempDir::new().unwrap();
        let config = fast_config(data.path());
        let poll = config.poll;

        let scope_sim = SimTelescope::new();
        scope_sim.controls().refuse_connect(true);
        let scope = scope_sim.controls();
        let camera_controls = SimCameraControls::default();
        let focuser_sim = SimFocuser::new(5000);
        let metric = Arc::new(SimulatedFocusMetric::new(
            focuser_sim.controls(),
            4900,
            2.0,
            0.01,
        ));
        let focuser = FocuserRig::spawn(Box::new(focuser_sim));
        let focus = Arc::new(FocusController::new(
            focuser.clone(),
            metric,
            config.focus.clone(),
        ));
        let factory_controls = camera_controls.clone();
        let (safety_tx, safety_rx) = watch::channel(SafetyReading::default());

        let mut controller = ObservationController::new(
            config,
            FilterWheelConfig::default(),
            DeviceSet {
                telescope: TelescopeRig::spawn(Box::new(scope_sim), poll),
                dome: DomeRig::spawn(Box::new(SimDome::new()), poll),
                camera: CameraRig::spawn(
                    Box::new(SimCamera::with_controls(camera_controls)),
                    poll,
                ),
                focuser,
                lamp: LampRig::spawn(Box::new(SimLamp::new())),
            },
            Box::new(move || {
                CameraRig::spawn(
                    Box::new(SimCamera::with_controls(factory_controls.clone())),
                    poll,
                )
            }),
            Arc::new(SimHealth::new()),
            safety_rx,
            Arc::new(TestSun {
                sunset_delay: Duration::from_millis(50),
            }),
            focus,
            quiet_options(),
        );

        let report = controller.observe(&[ticket("M31", 2, &["R"], false)]).await;

        assert!(report.aborted);
        assert_eq!(report.frames_taken, 0);
        assert_eq!(scope.slew_count(), 0);
        drop(safety_tx);
    }

    #[tokio::test]
    async fn test_sun_up_pauses_and_resumes_the_same_ticket() {
        let mut h = build(quiet_options(), Duration::from_millis(30));
        let tickets = vec![ticket_with_exp("M51", 4, &["R"], false, 0.1)];
        let dir = h._data.path().join("M51");

        // Flip to daylight once the first frame is on disk, so the
        // pause lands mid-ticket, then clear shortly after.
        let safety_tx = h.safety_tx.clone();
        let first_frame = dir.join("M51_0.1s_R-0001.fits");
        tokio::spawn(async move {
            while !first_frame.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = safety_tx.send(SafetyReading {
                alert: false,
                sun_up: true,
            });
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = safety_tx.send(SafetyReading::default());
        });

        let report = h.controller.observe(&tickets).await;

        assert!(!report.aborted);
        // Paused mid-ticket, then resumed and finished the same ticket
        assert_eq!(report.frames_taken, 4);
        assert!(
            h.scope.slew_count() >= 2,
            "expected a re-slew after the pause, saw {} slew(s)",
            h.scope.slew_count()
        );
        for index in 1..=4 {
            assert!(dir.join(format!("M51_0.1s_R-{index:04}.fits")).exists());
        }
    }

    #[tokio::test]
    async fn test_watchdog_recreates_the_camera_and_retries_the_frame() {
        let mut h = build(quiet_options(), Duration::from_millis(50));
        h.health.wedge_once();
        let tickets = vec![ticket("M31", 3, &["R"], false)];

        let report = h.controller.observe(&tickets).await;

        assert!(!report.aborted);
        assert_eq!(report.frames_taken, 3);
        assert_eq!(h.health.terminate_count(), 1);
        // One connect at spawn, one from the recreated actor
        assert_eq!(h.camera.connect_count(), 2);
        let dir = h._data.path().join("M31");
        for index in 1..=3 {
            assert!(dir.join(format!("M31_0.01s_R-{index:04}.fits")).exists());
        }
    }

    #[tokio::test]
    async fn test_calibration_frames_taken_after_the_ticket_list() {
        let mut h = build(
            RunOptions {
                skip_shutdown: false,
                skip_calibration: false,
                skip_initial_focus: true,
            },
            Duration::from_millis(50),
        );
        let tickets = vec![ticket("M31", 1, &["R"], false)];

        let report = h.controller.observe(&tickets).await;

        // One flat for R plus one dark for the single exposure length
        assert_eq!(report.calibration_frames, 2);
        let cal = h._data.path().join("calibration");
        assert!(cal.join("Flat_0.01s_R-0001.fits").exists());
        assert!(cal.join("Dark_0.01s_dark-0001.fits").exists());
        assert!(!h.lamp.is_on());
    }

    #[tokio::test]
    async fn test_initial_focus_runs_before_imaging() {
        let mut h = build(
            RunOptions {
                skip_shutdown: false,
                skip_calibration: true,
                skip_initial_focus: false,
            },
            Duration::from_millis(50),
        );
        let tickets = vec![ticket("M31", 1, &["R"], false)];

        let report = h.controller.observe(&tickets).await;

        assert_eq!(report.frames_taken, 1);
        let dir = h._data.path().join("M31");
        assert!(dir.join("focus_probe-0001.fits").exists());
        assert!(dir.join("M31_0.01s_R-0001.fits").exists());
    }
}
