//! Configuration of the skirmish match server.
//!
//! Settings persist to disk as a RON file, missing fields fall back to
//! defaults, and command-line flags override whatever was loaded.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, DebugConfig, DownloadConfig, NetworkConfig, PredictionConfig,
    ServerConfig,
};
pub use error::ConfigError;
