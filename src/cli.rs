// CLI definitions using clap

use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rgbhook")]
#[command(author, version, about = "Declarative D-Bus hooks for OpenRGB lighting")]
#[command(propagate_version = true)]
pub struct Cli {
    /// OpenRGB server host (overrides the configuration)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// OpenRGB server port (overrides the configuration)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Attach every hook and run until Ctrl-C
    #[command(visible_alias = "r")]
    Run {
        /// Configuration file (.toml, .yaml or .yml)
        config: PathBuf,
    },

    /// Validate a configuration and list its hooks
    #[command(visible_alias = "c")]
    Check {
        config: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List OpenRGB devices and zones
    #[command(visible_aliases = ["list", "ls"])]
    Devices {
        #[arg(long)]
        json: bool,
    },

    /// List the effect library
    Effects {
        /// Extra effect library (TOML)
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    /// Configuration file the command reads, if any
    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Commands::Run { config } | Commands::Check { config, .. } => Some(config),
            Commands::Devices { .. } | Commands::Effects { .. } => None,
        }
    }
}
