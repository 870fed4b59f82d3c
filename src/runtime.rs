// Arm runtime: joints, intent, input and the control loop wired together
//
// Threads:
// - control: bind joints, reset, calibrate, run the loop, stop everything
// - input: gamepad events -> intent state
// The async side only talks to zenoh and waits for Ctrl+C or the control thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use zenoh::Session;

use crate::bridge::{self, BridgeEndpoint};
use crate::config::{ArmConfig, KEY_BRIDGE, TOPIC_GAMEPAD, TOPIC_HEALTH};
use crate::control::ControlLoop;
use crate::feedback::{Feedback, FeedbackSink, HealthPublisher, Lifecycle, LogFeedback};
use crate::hardware::{Hardware, LiveHardware, SimHardware, build_joint_set};
use crate::input::{
    EvdevSource, GAMEPAD_NAME, InputAction, InputMapper, InputSource, IntentState, ZenohSource,
};
use crate::joints::{JointId, JointSet};
use crate::motor::RemoteLink;
use crate::telemetry::{PowerMonitor, log_power_info};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// How long the input thread waits for events before checking the running flag
const INPUT_POLL: Duration = Duration::from_millis(100);

/// Everything the input and control threads share
pub struct ArmContext {
    joints: Mutex<JointSet>,
    intent: IntentState,
    running: AtomicBool,
    recenter: AtomicBool,
    power: Mutex<Vec<Box<dyn PowerMonitor>>>,
}

impl Default for ArmContext {
    fn default() -> Self {
        Self::new(JointSet::new(), Vec::new())
    }
}

impl ArmContext {
    pub fn new(joints: JointSet, power: Vec<Box<dyn PowerMonitor>>) -> Self {
        Self {
            joints: Mutex::new(joints),
            intent: IntentState::new(),
            running: AtomicBool::new(true),
            recenter: AtomicBool::new(false),
            power: Mutex::new(power),
        }
    }

    /// Swap in the bound hardware
    pub fn install(&self, joints: JointSet, power: Vec<Box<dyn PowerMonitor>>) {
        *self.joints() = joints;
        *self.power.lock().unwrap_or_else(PoisonError::into_inner) = power;
    }

    // Poisoning is ignored: the stop sweep must always get the joints
    pub fn joints(&self) -> MutexGuard<'_, JointSet> {
        self.joints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn intent(&self) -> &IntentState {
        &self.intent
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The running flag, for long operations that should abort on shutdown
    pub fn running_flag(&self) -> &AtomicBool {
        &self.running
    }

    /// Clear all intent, then let the control loop wind down
    pub fn request_stop(&self) {
        self.intent.reset();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn request_recenter(&self) {
        self.recenter.store(true, Ordering::SeqCst);
    }

    pub fn take_recenter(&self) -> bool {
        self.recenter.swap(false, Ordering::SeqCst)
    }

    pub fn log_power(&self) {
        let mut monitors = self.power.lock().unwrap_or_else(PoisonError::into_inner);
        log_power_info(&mut monitors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum InputKind {
    /// Local gamepad via evdev
    Gamepad,
    /// JSON events on the gamepad topic
    Zenoh,
}

pub struct RunOptions {
    pub config: ArmConfig,
    pub sim: bool,
    pub skip_calibration: bool,
    pub input: InputKind,
    /// Gamepad device node; found by name when absent
    pub device: Option<PathBuf>,
}

/// Bind the joints, calibrate, and run the control loop until stopped
fn control_thread(
    ctx: &ArmContext,
    options: &RunOptions,
    session: Session,
    feedback: &mut dyn FeedbackSink,
) -> Result<(), Error> {
    let config = &options.config;
    let mut hardware: Box<dyn Hardware> = if options.sim {
        info!("Running on simulated motors");
        Box::new(SimHardware::new())
    } else {
        let link = RemoteLink::new(session, KEY_BRIDGE, config.remote_timeout());
        Box::new(LiveHardware::new(&config.serial_port, Some(link)))
    };

    let joints = build_joint_set(config, hardware.as_mut())?;
    ctx.install(joints, hardware.power_monitors());

    ctx.joints().reset_all();
    ctx.log_power();

    if options.skip_calibration {
        warn!("Skipping calibration, joint ranges are nominal");
    } else {
        feedback.notify(&Lifecycle::Calibrating);
        let order = JointId::calibration_order(config.calibrate_roll);
        let params = config.calibration.params();
        let result = ctx
            .joints()
            .calibrate(&order, &params, ctx.running_flag());
        match result {
            Ok(()) => feedback.notify(&Lifecycle::Calibrated),
            Err(e) if !ctx.is_running() => {
                info!("Calibration interrupted: {}", e);
                feedback.notify(&Lifecycle::Stopped);
                return Ok(());
            }
            Err(e) => {
                feedback.notify(&Lifecycle::CalibrationFailed);
                feedback.notify(&Lifecycle::Stopped);
                return Err(e.into());
            }
        }
    }

    ControlLoop::new(config.loop_period()).run(ctx, feedback);
    Ok(())
}

/// Feed gamepad events into the intent state until stopped or the source dies
fn input_thread(ctx: &ArmContext, mut source: Box<dyn InputSource>, mapper: InputMapper) {
    while ctx.is_running() {
        let events = match source.next_events(INPUT_POLL) {
            Ok(events) => events,
            Err(e) => {
                error!("Input lost: {}", e);
                ctx.request_stop();
                break;
            }
        };
        for event in events {
            match mapper.apply(&event, ctx.intent()) {
                InputAction::None => {}
                InputAction::Telemetry => ctx.log_power(),
                InputAction::Recenter => ctx.request_recenter(),
                InputAction::Shutdown => {
                    info!("Stop requested from gamepad");
                    ctx.request_stop();
                }
            }
        }
    }
}

async fn open_input(options: &RunOptions, session: &Session) -> Result<Box<dyn InputSource>, Error> {
    let source: Box<dyn InputSource> = match options.input {
        InputKind::Gamepad => match &options.device {
            Some(path) => Box::new(EvdevSource::open(path)?),
            None => Box::new(EvdevSource::find(GAMEPAD_NAME)?),
        },
        InputKind::Zenoh => {
            let subscriber = session.declare_subscriber(TOPIC_GAMEPAD).await?;
            info!("Subscribed to: {}", TOPIC_GAMEPAD);
            Box::new(ZenohSource::new(subscriber))
        }
    };
    Ok(source)
}

/// Wait for Ctrl+C or for the worker to finish on its own
async fn wait_for_exit(done: oneshot::Receiver<()>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupted, shutting down..."),
            Err(e) => warn!("Ctrl+C handler failed: {}", e),
        },
        _ = done => {}
    }
}

async fn join(handle: thread::JoinHandle<Result<(), Error>>) -> Result<(), Error> {
    match tokio::task::spawn_blocking(move || handle.join()).await? {
        Ok(result) => result,
        Err(_) => Err("worker thread panicked".into()),
    }
}

pub async fn run(options: RunOptions) -> Result<(), Error> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let health = session.declare_publisher(TOPIC_HEALTH).await?;
    info!("Publishing to: {}", TOPIC_HEALTH);

    let source = open_input(&options, &session).await?;
    let mapper = InputMapper::new(options.config.stick);
    let ctx = Arc::new(ArmContext::default());
    let (done_tx, done_rx) = oneshot::channel();

    let control = {
        let ctx = ctx.clone();
        let session = session.clone();
        thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                let mut feedback = Feedback::new()
                    .with(LogFeedback)
                    .with(HealthPublisher::new(health));
                let result = control_thread(&ctx, &options, session, &mut feedback);
                // The loop is gone; the input thread has nothing left to drive
                ctx.request_stop();
                let _ = done_tx.send(());
                result
            })?
    };

    // A gamepad read can block indefinitely, so this thread is never joined
    {
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("input".to_string())
            .spawn(move || input_thread(&ctx, source, mapper))?;
    }

    wait_for_exit(done_rx).await;
    ctx.request_stop();
    join(control).await?;

    info!("Runtime stopped");
    Ok(())
}

pub struct BridgeOptions {
    pub config: ArmConfig,
    pub sim: bool,
}

/// Serve this controller's motors to a remote arm runtime until Ctrl+C
pub async fn run_bridge(options: BridgeOptions) -> Result<(), Error> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let running = Arc::new(AtomicBool::new(true));
    let (done_tx, done_rx) = oneshot::channel();
    let worker = {
        let running = running.clone();
        thread::Builder::new()
            .name("bridge".to_string())
            .spawn(move || {
                let result = serve_bridge(&options, &session, &running);
                let _ = done_tx.send(());
                result
            })?
    };

    wait_for_exit(done_rx).await;
    running.store(false, Ordering::SeqCst);
    join(worker).await
}

fn serve_bridge(options: &BridgeOptions, session: &Session, running: &AtomicBool) -> Result<(), Error> {
    let config = &options.config;
    let mut endpoint = if options.sim {
        BridgeEndpoint::sim(&config.bridge)
    } else {
        BridgeEndpoint::live(&config.bridge, &config.serial_port)?
    };
    bridge::serve(session, KEY_BRIDGE, &mut endpoint, running)
}
