use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mcpmux",
    version,
    about = "MCP aggregator: one endpoint over a fleet of backend MCP servers"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/mcpmux.yaml")]
    pub config: PathBuf,

    /// Override the front-end bind host.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the front-end bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Disable destructive-tool marking at publish time.
    #[arg(long)]
    pub yolo: bool,
}
