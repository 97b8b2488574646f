//! testlabd — the test lab daemon.
//!
//! One binary, two roles:
//! - `run` starts the scheduler: opens the state store, connects to every
//!   configured drone and ticks the dispatcher until Ctrl-C
//! - `drone-utility` is what the scheduler runs on a drone over ssh; it
//!   reads one call batch on stdin and writes the reply on stdout
//!
//! # Usage
//!
//! ```text
//! testlabd run --config /etc/testlab/testlab.toml --data-dir /var/lib/testlab
//! testlabd drone-utility < batch.json
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use testlab_core::LabConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "info,testlabd=debug,testlab_scheduler=debug,testlab_rdb=debug,testlab_drone=debug";

#[derive(Parser)]
#[command(name = "testlabd", about = "Test lab scheduler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler.
    Run {
        /// Lab configuration file.
        #[arg(long, default_value = "/etc/testlab/testlab.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/testlab")]
        data_dir: PathBuf,

        /// Also queue cleanup for hosts left in repair_failed.
        #[arg(long)]
        recover_hosts: bool,
    },

    /// Serve one call batch from stdin (run on drones by the scheduler).
    DroneUtility,

    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long, default_value = "/etc/testlab/testlab.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the drone utility's reply, so logs always go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Run {
            config,
            data_dir,
            recover_hosts,
        } => {
            let config = LabConfig::from_file(&config)?;
            daemon::run_scheduler(config, data_dir, recover_hosts).await
        }
        Command::DroneUtility => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            testlab_drone::utility::serve(stdin.lock(), stdout.lock())
        }
        Command::CheckConfig { config } => {
            let config = LabConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
