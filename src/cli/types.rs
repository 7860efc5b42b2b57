use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
    /// Search for nearby sensors and list them
    Scan,
    /// Search for nearby sensors and connect to the one with the given id
    Connect {
        id: String,
    },
    /// Write the default configuration file
    InitConfig,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "sensor-link", version, about = "Discover and connect to bluetooth temperature sensors")]
pub struct Args {
    /// Path of the configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// How long a scan cycle searches, for example "3s" or "1500ms"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub scan_duration: Option<Duration>,

    /// Log debug messages
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub action: Action,
}
