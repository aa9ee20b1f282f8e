//! `nightwatch` binary
//!
//! Wires the device actors, the conditions monitor, and the
//! observation controller together and runs a night of tickets. The
//! device layer is simulator-backed; the conditions source is the
//! configured HTTP safety monitor when one is set.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nightwatch_drivers::simulator::{
    SimCamera, SimCameraControls, SimConditions, SimDome, SimFocuser, SimHealth, SimLamp,
    SimTelescope,
};
use nightwatch_drivers::{ConditionsSource, HttpSafetyMonitor};
use nightwatch_observatory::controller::CameraFactory;
use nightwatch_observatory::devices::{CameraRig, DomeRig, FocuserRig, LampRig, TelescopeRig};
use nightwatch_observatory::focus::{FocusController, SimulatedFocusMetric};
use nightwatch_observatory::{
    load_tickets, ConditionsMonitor, DeviceSet, FilterWheelConfig, ObservationController,
    ObservatoryConfig, RunOptions, SiteEphemeris,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nightwatch", version, about = "Unattended observatory automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a night of observation tickets
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Ticket files, or a single directory of .json tickets
    #[arg(required = true)]
    obs_tickets: Vec<PathBuf>,

    /// Image output directory (overrides the config file)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Observatory config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Filter wheel config file
    #[arg(short, long)]
    filter: Option<PathBuf>,

    /// Write the log to this file instead of stderr
    #[arg(short, long)]
    logger: Option<PathBuf>,

    /// Leave every device as-is at the end of the run
    #[arg(long)]
    noshutdown: bool,

    /// Skip the flats and darks after the ticket list
    #[arg(long)]
    nocalibration: bool,

    /// Skip the initial focus routine
    #[arg(long)]
    nofocus: bool,
}

fn init_tracing(logger: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match logger {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    init_tracing(args.logger.as_deref())?;

    let mut config = match &args.config {
        Some(path) => ObservatoryConfig::load(path)?,
        None => ObservatoryConfig::default(),
    };
    if let Some(data) = args.data {
        config.data_directory = data;
    }
    let wheel = match &args.filter {
        Some(path) => FilterWheelConfig::load(path)?,
        None => FilterWheelConfig::default(),
    };

    let tickets = load_tickets(&args.obs_tickets)?;
    tracing::info!("loaded {} ticket(s)", tickets.len());

    let source: Arc<dyn ConditionsSource> = if config.safety_monitor_url.is_empty() {
        tracing::warn!("no safety monitor configured, simulating clear conditions");
        Arc::new(SimConditions::new())
    } else {
        Arc::new(HttpSafetyMonitor::new(config.safety_monitor_url.clone()))
    };
    let ephemeris = Arc::new(SiteEphemeris {
        latitude: config.site_latitude,
        longitude: config.site_longitude,
    });
    let monitor = ConditionsMonitor::start(source, ephemeris.clone(), config.weather_cadence());

    let poll = config.poll;
    let camera_controls = SimCameraControls::default();
    let focuser_sim = SimFocuser::new(5000);
    let focuser_controls = focuser_sim.controls();

    let telescope = TelescopeRig::spawn(Box::new(SimTelescope::new()), poll);
    let dome = DomeRig::spawn(Box::new(SimDome::new()), poll);
    let camera = CameraRig::spawn(
        Box::new(SimCamera::with_controls(camera_controls.clone())),
        poll,
    );
    let focuser = FocuserRig::spawn(Box::new(focuser_sim));
    let lamp = LampRig::spawn(Box::new(SimLamp::new()));

    let camera_factory: CameraFactory = Box::new(move || {
        CameraRig::spawn(
            Box::new(SimCamera::with_controls(camera_controls.clone())),
            poll,
        )
    });

    let metric = Arc::new(SimulatedFocusMetric::new(focuser_controls, 4750, 2.2, 0.01));
    let focus = Arc::new(FocusController::new(
        focuser.clone(),
        metric,
        config.focus.clone(),
    ));

    let options = RunOptions {
        skip_shutdown: args.noshutdown,
        skip_calibration: args.nocalibration,
        skip_initial_focus: args.nofocus,
    };

    let mut controller = ObservationController::new(
        config,
        wheel,
        DeviceSet {
            telescope,
            dome,
            camera,
            focuser,
            lamp,
        },
        camera_factory,
        Arc::new(SimHealth::new()),
        monitor.subscribe(),
        ephemeris,
        focus,
        options,
    );

    let report = controller.observe(&tickets).await;
    monitor.stop();

    println!(
        "{} of {} frame(s) taken across {} ticket(s); {} calibration frame(s)",
        report.frames_taken,
        report.frames_requested,
        report.tickets_attempted,
        report.calibration_frames
    );
    if report.aborted {
        anyhow::bail!("the run was aborted before the ticket list completed");
    }
    Ok(())
}
