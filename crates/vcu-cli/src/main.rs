//! vcuctl - operator console for vehicle control units
//!
//! Talks to the unit through a serial CAN adapter (AT-command or slcan
//! dialect) reachable over TCP.

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vcu_link::{ParameterRegistry, Session};

use crate::config::{Config, MergedConfig};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "vcuctl")]
#[command(author, version, about = "Vehicle control unit console")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VCUCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Adapter host (switches the transport to TCP)
    #[arg(long, env = "VCUCTL_HOST", global = true)]
    host: Option<String>,

    /// Adapter TCP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Parameter registry file
    #[arg(short, long, env = "VCUCTL_REGISTRY", global = true)]
    registry: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the adapter dialect
    Detect,

    /// List the parameter registry
    Params,

    /// Poll parameters and print updates until Ctrl+C
    Monitor {
        /// Parameter ID(s) to poll (default: the whole registry)
        params: Vec<String>,
    },

    /// Send one diagnostic request
    Send {
        /// Destination CAN id (3 hex digits)
        can_id: String,

        /// Request payload as hex, e.g. 220301
        payload: String,

        /// How long to print replies for, in milliseconds
        #[arg(long, default_value = "500")]
        listen_ms: u64,
    },

    /// Write a data identifier (UDS 0x2E)
    Write {
        /// Destination CAN id (3 hex digits)
        can_id: String,

        /// Data identifier as hex, e.g. 0301
        did: String,

        /// Data bytes as hex
        data: String,

        /// How long to wait for the response, in milliseconds
        #[arg(long, default_value = "1000")]
        listen_ms: u64,
    },

    /// Flash firmware through the unit's bootloader
    Flash {
        /// Firmware image path
        file: PathBuf,

        /// Device token as hex (1 to 4 bytes)
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_filter = if cli.verbose {
        "vcuctl=debug,vcu_link=debug"
    } else {
        "vcuctl=info,vcu_link=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(
        cli.host.as_deref(),
        cli.port,
        cli.registry.as_deref(),
        cli.no_color,
    );

    let ctx = OutputContext::new(cli.output, merged.no_color, cli.quiet);

    if let Err(e) = run(&cli.command, &merged, &ctx).await {
        ctx.error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: &Commands, merged: &MergedConfig, ctx: &OutputContext) -> Result<()> {
    match command {
        Commands::Detect => commands::detect(&merged.link, ctx).await,

        Commands::Params => {
            let registry = load_registry(merged)?;
            commands::params(&registry, ctx);
            Ok(())
        }

        Commands::Monitor { params } => {
            let registry = load_registry(merged)?;
            let session = connect(merged).await?;
            let result = commands::monitor(&session, &registry, params, ctx).await;
            close(session).await;
            result
        }

        Commands::Send {
            can_id,
            payload,
            listen_ms,
        } => {
            let session = connect(merged).await?;
            let listen = Duration::from_millis(*listen_ms);
            let result = commands::send(&session, can_id, payload, listen, ctx).await;
            close(session).await;
            result
        }

        Commands::Write {
            can_id,
            did,
            data,
            listen_ms,
        } => {
            let session = connect(merged).await?;
            let listen = Duration::from_millis(*listen_ms);
            let result = commands::write(&session, can_id, did, data, listen, ctx).await;
            close(session).await;
            result
        }

        Commands::Flash { file, token } => {
            let session = connect(merged).await?;
            let result = commands::flash(&session, file, token, ctx).await;
            close(session).await;
            result
        }
    }
}

/// Open the configured channel and initialise the adapter
async fn connect(merged: &MergedConfig) -> Result<Session> {
    Session::connect(merged.link.clone())
        .await
        .context("Failed to connect to adapter")
}

async fn close(session: Session) {
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "Failed to close session");
    }
}

fn load_registry(merged: &MergedConfig) -> Result<ParameterRegistry> {
    let path = merged.registry_path()?;
    ParameterRegistry::from_file(path)
        .with_context(|| format!("Failed to load parameter registry {}", path.display()))
}
