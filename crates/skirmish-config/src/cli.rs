//! Command-line argument parsing for the match server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Skirmish server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "skirmish-server", about = "Skirmish dedicated match server")]
pub struct CliArgs {
    /// Address to listen on; repeat for several address families.
    #[arg(long = "listen")]
    pub listen_addresses: Vec<String>,

    /// Listening port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of connected sessions.
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Display name of the match.
    #[arg(long)]
    pub match_name: Option<String>,

    /// Map name.
    #[arg(long)]
    pub map: Option<String>,

    /// Directory of the assets served to clients.
    #[arg(long)]
    pub assets: Option<PathBuf>,

    /// Directory of the client scripts.
    #[arg(long)]
    pub scripts: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if !args.listen_addresses.is_empty() {
            self.network.listen_addresses = args.listen_addresses.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_sessions {
            self.network.max_sessions = max;
        }
        if let Some(ref name) = args.match_name {
            self.server.match_name = name.clone();
        }
        if let Some(ref map) = args.map {
            self.server.map = map.clone();
        }
        if let Some(ref dir) = args.assets {
            self.server.asset_directory = dir.clone();
        }
        if let Some(ref dir) = args.scripts {
            self.server.script_directory = dir.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
