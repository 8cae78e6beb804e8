use std::path::PathBuf;
use std::process::ExitCode;
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use servo_link::{init_logging, parse_target, run, Command};
use servo_link::error::{AppRunError, ConfigError};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Connects to a servo controller over bluetooth.\n\nExample: servo-link move 1:90 2:45.5", long_about = None)]
struct Args {
    /// Path to the config file. Defaults to servo-link.json next to the executable, or the
    /// platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Connect and print the session state and telemetry until Ctrl-C
    Monitor,

    /// Connect, send one command frame, and disconnect
    Move {
        /// Servo targets as ID:ANGLE (degrees)
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Print the effective config
    Config,
}

fn to_command(command: CliCommand) -> Result<Command, AppRunError> {
    Ok(match command {
        CliCommand::Monitor => Command::Monitor,
        CliCommand::Move { targets } => Command::Move(
            targets.iter().map(|target| parse_target(target)).collect::<Result<_, _>>()?
        ),
        CliCommand::Config => Command::ShowConfig,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    if let Err(err) = init_logging(level) {
        eprintln!("Failed to initialize logger: {}", err);
        return ExitCode::FAILURE;
    }
    info!(concat!("servo-link ", env!("CARGO_PKG_VERSION")));

    let result = match to_command(args.command) {
        Ok(command) => run(args.config.as_deref(), command).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another servo-link process is already using the device");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}
