//! Configuration structs with sensible defaults and RON persistence.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening sockets and connection liveness.
    pub network: NetworkConfig,
    /// Asset and script distribution.
    pub download: DownloadConfig,
    /// Movement model shared with predicting clients.
    pub prediction: PredictionConfig,
    /// Match content.
    pub server: ServerConfig,
    /// Diagnostics.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Addresses to listen on; one reactor is started per address family.
    pub listen_addresses: Vec<String>,
    /// Listening port.
    pub port: u16,
    /// Maximum number of connected sessions.
    pub max_sessions: usize,
    /// Delay between two heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is dropped, in milliseconds.
    pub peer_timeout_ms: u64,
    /// Largest accepted frame payload, in bytes.
    pub max_payload_size: u32,
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Size of a streamed file fragment, in bytes.
    pub fragment_size: u32,
    /// Fragment bytes streamed per server tick.
    pub fragment_bytes_per_tick: usize,
    /// HTTP requests a client may run at once.
    pub max_simultaneous_downloads: usize,
    /// HTTP mirrors advertised to clients; empty streams assets in-match.
    pub asset_base_urls: Vec<String>,
    /// Additional attempts for retryable download failures.
    pub max_retries: u32,
}

/// Movement and prediction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    /// Number of input ticks kept for replay.
    pub max_history: usize,
    /// Downward acceleration, units/s².
    pub gravity: f32,
    /// Horizontal walk speed, units/s.
    pub walk_speed: f32,
    /// Horizontal acceleration on the ground, units/s².
    pub ground_acceleration: f32,
    /// Horizontal acceleration in the air, units/s².
    pub air_acceleration: f32,
    /// Upward speed of a jump, units/s.
    pub jump_speed: f32,
    /// Longest held jump, seconds.
    pub max_jump_time: f32,
    /// Ground deceleration with no direction held, units/s².
    pub friction: f32,
    /// Simulation ticks per second.
    pub tick_rate: u32,
}

/// Match content configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Display name of the match.
    pub match_name: String,
    /// Active gamemode.
    pub gamemode: String,
    /// Map name.
    pub map: String,
    /// Directory whose files are served as match assets.
    pub asset_directory: PathBuf,
    /// Directory whose files are served as client scripts.
    pub script_directory: PathBuf,
}

/// Diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Defaults ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["0.0.0.0".to_string()],
            port: 14_768,
            max_sessions: 32,
            heartbeat_interval_ms: 1_000,
            peer_timeout_ms: 10_000,
            max_payload_size: 1_048_576,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1_024,
            fragment_bytes_per_tick: 65_536,
            max_simultaneous_downloads: 2,
            asset_base_urls: Vec::new(),
            max_retries: 0,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_history: 128,
            gravity: 1_200.0,
            walk_speed: 250.0,
            ground_acceleration: 2_000.0,
            air_acceleration: 600.0,
            jump_speed: 420.0,
            max_jump_time: 0.2,
            friction: 2_400.0,
            tick_rate: 60,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            match_name: "Skirmish".to_string(),
            gamemode: "deathmatch".to_string(),
            map: "arena".to_string(),
            asset_directory: PathBuf::from("assets"),
            script_directory: PathBuf::from("scripts"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Derived values ---

impl NetworkConfig {
    /// Socket addresses to listen on.
    pub fn listen_socket_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.listen_addresses
            .iter()
            .map(|address| {
                address
                    .parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, self.port))
                    .map_err(|_| ConfigError::InvalidAddress(address.clone()))
            })
            .collect()
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Peer timeout as a [`Duration`].
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

impl PredictionConfig {
    /// Duration of one simulation tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }
}

// --- Persistence ---

/// File holding the configuration inside a config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

impl Config {
    /// Path of the config file inside `config_dir`.
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE_NAME)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&text).map_err(ConfigError::ParseError)
    }

    /// Read `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_in(config_dir);
        if !path.exists() {
            let config = Self::default();
            config.save(config_dir)?;
            log::info!("Wrote default server config to {}", path.display());
            return Ok(config);
        }
        let config = Self::read(&path)?;
        log::info!("Using server config {}", path.display());
        Ok(config)
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;
        std::fs::write(Self::path_in(config_dir), text).map_err(ConfigError::WriteError)
    }

    /// Re-read the file; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&Self::path_in(config_dir))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Server config changed on disk");
        Ok(Some(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_file_lists_defaults() {
        let dir = tempfile::tempdir().unwrap();
        Config::default().save(dir.path()).unwrap();
        let text = std::fs::read_to_string(Config::path_in(dir.path())).unwrap();
        assert!(text.contains("port: 14768"));
        assert!(text.contains("fragment_size: 1024"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (port: 9000), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.max_sessions, 32);
        assert_eq!(config.download, DownloadConfig::default());
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let config: Config = ron::from_str("(server: (map: \"canyon\", weather: \"rain\"))").unwrap();
        assert_eq!(config.server.map, "canyon");
    }

    #[test]
    fn test_first_load_writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("skirmish");
        assert_eq!(Config::load_or_create(&nested).unwrap(), Config::default());
        assert!(Config::path_in(&nested).exists());

        let mut edited = Config::default();
        edited.server.match_name = "Friday night".to_string();
        edited.download.asset_base_urls = vec!["https://cdn.example.org/".to_string()];
        edited.save(&nested).unwrap();
        assert_eq!(Config::load_or_create(&nested).unwrap(), edited);
    }

    #[test]
    fn test_reload_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let running = Config::default();
        running.save(dir.path()).unwrap();
        assert_eq!(running.reload(dir.path()).unwrap(), None);

        let mut on_disk = running.clone();
        on_disk.network.max_sessions = 4;
        on_disk.save(dir.path()).unwrap();
        assert_eq!(running.reload(dir.path()).unwrap(), Some(on_disk));
    }

    #[test]
    fn test_reload_without_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::default().reload(dir.path()),
            Err(ConfigError::ReadError(_))
        ));
    }

    #[test]
    fn test_broken_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(Config::path_in(dir.path()), "(network: (port: \"high\"))").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_listen_addresses() {
        let mut network = NetworkConfig {
            listen_addresses: vec!["0.0.0.0".into(), "::".into()],
            port: 4000,
            ..NetworkConfig::default()
        };
        let addrs = network.listen_socket_addrs().unwrap();
        assert_eq!(addrs[0], "0.0.0.0:4000".parse().unwrap());
        assert_eq!(addrs[1], "[::]:4000".parse().unwrap());

        network.listen_addresses.push("localhost".into());
        assert!(matches!(
            network.listen_socket_addrs(),
            Err(ConfigError::InvalidAddress(a)) if a == "localhost"
        ));
    }

    #[test]
    fn test_tick_duration() {
        let prediction = PredictionConfig {
            tick_rate: 50,
            ..PredictionConfig::default()
        };
        assert_eq!(prediction.tick_duration(), Duration::from_millis(20));
    }
}
