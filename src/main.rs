use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use emotive_robot::config::{DEFAULT_CONFIG_PATH, DEFAULT_HTTP_ADDR, RobotConfig};
use emotive_robot::demonstration::{self, Demonstration};
use emotive_robot::gestures::{self, Emotion};
use emotive_robot::motor::{
    BoxedTransport, MotorKey, Robot, RobotError, Selection, SerialBus, SimulatedBus,
};
use emotive_robot::sequence::Sequence;
use emotive_robot::server::{self, AppState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(version, about = "Gesture controller for Dynamixel servo robots")]
struct Cli {
    /// Robot configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against an in-memory bus instead of the serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP gesture trigger
    Serve {
        #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
        addr: String,
    },
    /// Perform one emotion gesture
    Gesture { emotion: Emotion },
    /// Play a sequence file
    Play { file: PathBuf },
    /// Record a demonstration while the robot is moved by hand
    Record {
        file: PathBuf,
        #[arg(long, num_args = 1.., default_values = ["5", "6"])]
        motors: Vec<MotorKey>,
        /// Recording length in seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
        /// Sample interval in milliseconds
        #[arg(long, default_value_t = 10)]
        interval_ms: u64,
    },
    /// Replay a recorded demonstration
    Replay { file: PathBuf },
    /// Log present positions ("all" or motor names/IDs)
    Status {
        #[arg(default_values = ["all"])]
        motors: Vec<String>,
    },
    /// Log hardware error status ("all" or motor names/IDs)
    Diagnostic {
        #[arg(default_values = ["all"])]
        motors: Vec<String>,
    },
    /// Move every motor to 0 degrees
    Reset,
    /// Log the loaded configuration
    Describe,
}

fn connect(config_path: &Path, simulate: bool) -> Result<Robot<BoxedTransport>, RobotError> {
    let config = RobotConfig::load(config_path)?;
    let transport: BoxedTransport = if simulate {
        info!("Using simulated bus");
        Box::new(SimulatedBus::from_config(&config))
    } else {
        Box::new(SerialBus::new(config.controllers.port.clone()))
    };
    Robot::new(config, transport)
}

/// Run `task` on a fresh controller and always shut it down afterwards
fn with_robot<R>(
    cli: &Cli,
    task: impl FnOnce(&mut Robot<BoxedTransport>) -> Result<R, BoxError>,
) -> Result<R, BoxError> {
    let mut robot = connect(&cli.config, cli.simulate)?;
    let result = task(&mut robot);
    let shutdown = robot.clean_shutdown();
    let value = result?;
    shutdown?;
    Ok(value)
}

fn run(cli: Cli) -> Result<(), BoxError> {
    match &cli.command {
        Command::Serve { addr } => {
            let config_path = cli.config.clone();
            let simulate = cli.simulate;
            // Fail fast on a broken config before accepting requests
            RobotConfig::load(&config_path)?.validate()?;
            let state = AppState::new(move || connect(&config_path, simulate));
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(addr, state))?;
        }
        Command::Gesture { emotion } => {
            let emotion = *emotion;
            with_robot(&cli, |robot| Ok(gestures::perform(emotion, robot)?))?;
        }
        Command::Play { file } => {
            let sequence = Sequence::load(file)?;
            sequence.describe();
            with_robot(&cli, |robot| {
                robot.enable_torque()?;
                sequence.play(robot)?;
                Ok(())
            })?;
        }
        Command::Record {
            file,
            motors,
            duration,
            interval_ms,
        } => {
            let duration = Duration::try_from_secs_f64(*duration)?;
            let interval = Duration::from_millis(*interval_ms);
            let recorded = with_robot(&cli, |robot| {
                Ok(demonstration::record(robot, motors, duration, interval)?)
            })?;
            recorded.save(file)?;
            info!("Saved demonstration to {}", file.display());
        }
        Command::Replay { file } => {
            let recorded = Demonstration::load(file)?;
            with_robot(&cli, |robot| Ok(demonstration::replay(robot, &recorded)?))?;
        }
        Command::Status { motors } => {
            let selection = Selection::parse(motors)?;
            with_robot(&cli, |robot| {
                for status in robot.check_motor_status(&selection)? {
                    println!(
                        "{:>3} {:<16} {:>5} {:>8.2}°",
                        status.id, status.alias, status.position, status.degrees
                    );
                }
                Ok(())
            })?;
        }
        Command::Diagnostic { motors } => {
            let selection = Selection::parse(motors)?;
            with_robot(&cli, |robot| {
                for diagnostic in robot.get_diagnostic(&selection)? {
                    println!(
                        "{:>3} {:<16} {:#010b} {:?}",
                        diagnostic.id, diagnostic.alias, diagnostic.raw, diagnostic.errors
                    );
                }
                Ok(())
            })?;
        }
        Command::Reset => {
            with_robot(&cli, |robot| {
                robot.enable_torque()?;
                robot.reset()?;
                Ok(())
            })?;
        }
        Command::Describe => {
            with_robot(&cli, |robot| {
                robot.describe();
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
