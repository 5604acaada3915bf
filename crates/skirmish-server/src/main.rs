//! Dedicated skirmish match server.
//!
//! Run with: `cargo run -p skirmish-server -- --port 14768 --assets assets`

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use skirmish_config::{CliArgs, Config};
use skirmish_download::{FileFragmentServer, FragmentServerConfig};
use skirmish_server::{FixedTimestep, MatchServer, MatchSettings, ScriptLibrary, load_assets};
use skirmish_session::framing::FrameConfig;
use skirmish_session::{NetworkSessionManager, ReactorConfig};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir)
        .with_context(|| format!("loading config from {}", config_dir.display()))?;
    config.apply_cli_overrides(&args);

    skirmish_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );
    info!("Skirmish server: {}", config.server.match_name);

    let reactor_config = ReactorConfig {
        max_peers: config.network.max_sessions,
        frame: FrameConfig {
            max_payload_size: config.network.max_payload_size,
        },
        heartbeat_interval: config.network.heartbeat_interval(),
        peer_timeout: config.network.peer_timeout(),
        ..ReactorConfig::default()
    };
    let addrs = config.network.listen_socket_addrs()?;
    let network = NetworkSessionManager::listen(&addrs, &reactor_config)
        .context("opening listening sockets")?;
    for addr in network.local_addrs() {
        info!("Listening on {addr}");
    }

    let mut files = FileFragmentServer::new(FragmentServerConfig {
        fragment_size: config.download.fragment_size,
        bytes_per_update: config.download.fragment_bytes_per_tick,
    });
    load_assets(&mut files, &config.server.asset_directory).with_context(|| {
        format!(
            "loading assets from {}",
            config.server.asset_directory.display()
        )
    })?;
    let scripts = ScriptLibrary::load(&config.server.script_directory).with_context(|| {
        format!(
            "loading scripts from {}",
            config.server.script_directory.display()
        )
    })?;

    let settings = MatchSettings::from_config(&config);
    info!(
        "Match: map={} gamemode={} tick={}ms",
        settings.map, settings.gamemode, settings.tick_duration_ms
    );
    let mut server = MatchServer::new(settings, files, scripts)?;
    server.add_manager(Box::new(network));

    let mut timestep = FixedTimestep::new(config.prediction.tick_duration());
    loop {
        timestep.tick(|_| server.update());
        std::thread::sleep(timestep.time_until_next_tick());
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("skirmish"))
        .unwrap_or_else(|| PathBuf::from("."))
}
