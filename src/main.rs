//! `vclone` command line driver.
//!
//! Reads one driver config file and either creates the VM it describes or
//! destroys it again. The created VM is printed as JSON on stdout.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vclone::CloneService;

use crate::config::DriverConfig;

#[derive(Parser)]
#[clap(name = "vclone", version, about = "Clone VMs on vSphere and wait for their IP")]
struct Cli {
    /// Driver config file (YAML or JSON)
    #[clap(short = 'c', long = "config", global = true, default_value = "vclone.yml")]
    config: PathBuf,

    /// Log debug output (overridden by RUST_LOG)
    #[clap(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone the configured VM and wait for its address
    Create {
        /// Destroy the VM again if a step after cloning fails
        #[clap(long)]
        rollback: bool,
    },
    /// Power off and delete the configured VM
    Destroy,
}

/// Install the tracing subscriber; `log` records from the engine are
/// forwarded into it.
fn install_tracing(verbose: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    let config = DriverConfig::load(&cli.config)?;
    let mut service = CloneService::connect(&config.connection)
        .await
        .with_context(|| format!("Connecting to {}", config.connection.host))?;

    let result = run(&service, &config, cli.command).await;

    if let Err(e) = service.disconnect().await {
        tracing::warn!("Logout failed: {e}");
    }
    result
}

async fn run(service: &CloneService, config: &DriverConfig, command: Commands) -> anyhow::Result<()> {
    let request = &config.request;
    match command {
        Commands::Create { rollback } => {
            let outcome = service
                .create(request, rollback || config.rollback)
                .await
                .with_context(|| format!("Creating {}", request.vm_name))?;
            for warning in &outcome.warnings {
                tracing::warn!("{warning}");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Destroy => {
            let destroyed = service
                .destroy(&request.datacenter, &request.vm_path())
                .await
                .with_context(|| format!("Destroying {}", request.vm_name))?;
            if !destroyed {
                tracing::info!("{} does not exist", request.vm_path());
            }
        }
    }
    Ok(())
}
