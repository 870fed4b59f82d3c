use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use arm_teleop_runtime::config::ArmConfig;
use arm_teleop_runtime::runtime::{self, BridgeOptions, InputKind, RunOptions};

/// Gamepad teleoperation runtime for a multi-joint robot arm
#[derive(Parser)]
#[command(name = "arm-teleop-runtime", version)]
struct Cli {
    /// JSON config file; built-in arm layout when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated motors instead of hardware
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate the arm and drive it from the gamepad (default)
    Run {
        /// Start with nominal joint ranges instead of calibrating
        #[arg(long)]
        skip_calibration: bool,

        /// Where gamepad events come from
        #[arg(long, value_enum, default_value = "gamepad")]
        input: InputKind,

        /// Gamepad device node, e.g. /dev/input/event2
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Serve this controller's motors to a remote arm runtime
    Bridge,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match ArmConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error in {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => ArmConfig::default(),
    };

    let result = match cli.command.unwrap_or(Command::Run {
        skip_calibration: false,
        input: InputKind::Gamepad,
        device: None,
    }) {
        Command::Run {
            skip_calibration,
            input,
            device,
        } => {
            runtime::run(RunOptions {
                config,
                sim: cli.sim,
                skip_calibration,
                input,
                device,
            })
            .await
        }
        Command::Bridge => {
            runtime::run_bridge(BridgeOptions {
                config,
                sim: cli.sim,
            })
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
