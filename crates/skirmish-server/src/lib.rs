//! Dedicated match server: content loading, the fixed-timestep loop and the
//! authoritative match driven by the session layer.

pub mod assets;
pub mod game_loop;
pub mod match_server;

pub use assets::{ScriptLibrary, collect_files, load_assets};
pub use game_loop::FixedTimestep;
pub use match_server::{ClientRequest, MatchServer, MatchSettings, server_commands};
