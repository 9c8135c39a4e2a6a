//! rgbhook CLI
//!
//! Runs declarative hooks that light OpenRGB devices in response to D-Bus signals.

use anyhow::Result;
use clap::Parser;
use rgbhook::Config;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{Cli, Commands};

mod commands;
use commands::ServerArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load before logging starts so the configured level applies; report errors after.
    let config = cli.command.config_path().map(Config::load);
    let configured = match &config {
        Some(Ok(config)) => config.log_level().ok().flatten(),
        _ => None,
    };
    init_logging(cli.verbose, configured.as_deref());

    let server = ServerArgs {
        host: cli.host,
        port: cli.port,
    };

    match cli.command {
        Commands::Run { .. } => {
            let config = config.transpose()?.ok_or_else(|| anyhow::anyhow!("no configuration"))?;
            commands::run::run(config, server).await
        }
        Commands::Check { json, .. } => {
            let config = config.transpose()?.ok_or_else(|| anyhow::anyhow!("no configuration"))?;
            commands::inspect::check(&config, json)
        }
        Commands::Devices { json } => commands::inspect::devices(&server, json).await,
        Commands::Effects { file, json } => commands::inspect::effects(file.as_deref(), json),
    }
}

/// `RUST_LOG` wins, then `-v`, then the configured level
fn init_logging(verbose: u8, configured: Option<&str>) {
    let level = match verbose {
        0 => configured.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "rgbhook={level},rgbhook_bus={level},openrgb_client={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
