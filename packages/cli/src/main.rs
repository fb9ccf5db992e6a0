//! BoardLink CLI entry point
//!
//! A thin consumer of `boardlink-client`: discovery, device listing, serial
//! monitoring, uploads, and board provisioning from the command line.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;

mod commands;
mod config;
mod registry;

#[derive(Parser)]
#[command(name = "boardlink")]
#[command(author, version, about = "BoardLink - command line client for the flashing agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the local agent and print its endpoint
    Discover,
    /// List boards attached to the agent
    List {
        /// Keep printing the list whenever it changes
        #[arg(short, long)]
        watch: bool,
    },
    /// Stream a serial port to stdout
    Monitor {
        #[arg(short, long)]
        port: String,

        #[arg(short, long, default_value_t = 9600)]
        baudrate: u32,
    },
    /// Flash an image onto a board
    Upload {
        /// Board identifier (fqbn)
        #[arg(long)]
        board: String,

        #[arg(long)]
        port: String,

        /// Flashing commandline for the agent
        #[arg(long)]
        commandline: String,

        /// Commandline signature
        #[arg(long, default_value = "")]
        signature: String,

        /// Image files; the first is the primary image
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Provision a board for the cloud
    Provision {
        #[arg(long)]
        fqbn: String,

        #[arg(long)]
        port: String,

        /// Device id assigned by the registration backend
        #[arg(long)]
        device_id: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Discover => commands::discover::run(&config).await,
        Commands::List { watch } => commands::list::run(&config, watch).await,
        Commands::Monitor { port, baudrate } => {
            commands::monitor::run(&config, &port, baudrate).await
        }
        Commands::Upload {
            board,
            port,
            commandline,
            signature,
            files,
        } => commands::upload::run(&config, board, port, commandline, signature, files).await,
        Commands::Provision {
            fqbn,
            port,
            device_id,
        } => commands::provision::run(&config, fqbn, port, device_id).await,
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn show_version() {
    println!("boardlink {}", env!("CARGO_PKG_VERSION"));
    println!("Command line client for the BoardLink flashing agent");
}
