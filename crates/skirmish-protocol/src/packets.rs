//! Match packet definitions.
//!
//! Every packet is a plain serde type implementing [`Packet`], which carries
//! its wire name, reliability flags and channel. The wire opcode is not part
//! of the type: it is the packet's position in the [`PacketTable`] built by
//! [`match_protocol`], which both ends construct identically.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command_store::PacketTable;

/// SHA-1 digest as transmitted on the wire (20 raw bytes).
pub type Checksum = [u8; 20];

// ---------------------------------------------------------------------------
// Packet metadata
// ---------------------------------------------------------------------------

/// Delivery flags attached to an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Best effort, may be dropped or reordered.
    pub const UNRELIABLE: Self = Self(0);
    /// Retransmitted until acknowledged, delivered in order.
    pub const RELIABLE: Self = Self(1 << 0);
    /// Delivered without sequencing against other packets on the channel.
    pub const UNSEQUENCED: Self = Self(1 << 1);

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from raw bits, ignoring unknown bits.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b11)
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if the packet must be delivered.
    pub const fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Channel carrying gameplay and control traffic.
pub const CHANNEL_DEFAULT: u8 = 0;
/// Channel carrying file and script transfers, so large downloads do not
/// stall gameplay packets.
pub const CHANNEL_DOWNLOAD: u8 = 1;
/// Channel carrying high-frequency input updates.
pub const CHANNEL_INPUTS: u8 = 2;

/// A typed packet that can be registered in a [`PacketTable`].
pub trait Packet: Serialize + DeserializeOwned + 'static {
    /// Wire name. Part of the protocol contract: both ends must agree.
    const NAME: &'static str;
    /// Delivery flags used when sending this packet.
    const FLAGS: PacketFlags = PacketFlags::RELIABLE;
    /// Channel used when sending this packet.
    const CHANNEL: u8 = CHANNEL_DEFAULT;
}

macro_rules! impl_packet {
    ($ty:ty, $name:literal) => {
        impl Packet for $ty {
            const NAME: &'static str = $name;
        }
    };
    ($ty:ty, $name:literal, $flags:expr, $channel:expr) => {
        impl Packet for $ty {
            const NAME: &'static str = $name;
            const FLAGS: PacketFlags = $flags;
            const CHANNEL: u8 = $channel;
        }
    };
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Client introduces itself and the local players it controls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    /// Client protocol revision; the server rejects mismatches.
    pub protocol_version: u32,
    /// One nickname per locally-controlled player.
    pub players: Vec<String>,
}

/// Server accepted the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSuccess {
    /// Session id assigned by the server.
    pub session_id: u64,
    /// Server-side player index for each local player, in [`Auth`] order.
    pub player_indices: Vec<u8>,
}

/// Server refused the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthFailure {
    /// Human-readable reason shown to the player.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Match setup
// ---------------------------------------------------------------------------

/// A file the client must obtain before the match can start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Protocol-level key of the file.
    pub download_path: String,
    /// Expected SHA-1 of the content.
    pub checksum: Checksum,
    /// Expected size in bytes.
    pub size: u64,
}

/// Match description sent after successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchData {
    /// Display name of the match.
    pub match_name: String,
    /// Active gamemode name.
    pub gamemode: String,
    /// Map name.
    pub map: String,
    /// Duration of a server tick in milliseconds.
    pub tick_duration_ms: u32,
    /// Server tick at the time the packet was built.
    pub current_tick: u32,
    /// Assets required by the match.
    pub assets: Vec<RemoteFile>,
    /// Client scripts required by the match.
    pub scripts: Vec<RemoteFile>,
    /// HTTP mirrors serving assets; empty means "download from the server".
    pub asset_base_urls: Vec<String>,
}

/// Incremental update of the sender's string store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStrings {
    /// Id of the first string in `strings`.
    pub start_id: u32,
    /// Strings with consecutive ids starting at `start_id`.
    pub strings: Vec<String>,
}

/// Client finished loading and is ready to play.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ready;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Spawn data for one networked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreation {
    /// Network id of the entity.
    pub id: u32,
    /// Entity class, as a string-store id.
    pub class_id: u32,
    /// World position.
    pub position: [f32; 2],
    /// Rotation in radians.
    pub rotation: f32,
    /// `(current, max)` health for entities that can be damaged.
    pub health: Option<(u16, u16)>,
    /// Id of the owning player, for player-controlled entities.
    pub owner: Option<u8>,
}

/// Server spawned entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateEntities {
    /// Server tick at which the entities exist.
    pub state_tick: u32,
    /// Entities to create.
    pub entities: Vec<EntityCreation>,
}

/// Server removed entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntities {
    /// Server tick at which the entities were removed.
    pub state_tick: u32,
    /// Network ids of removed entities.
    pub entities: Vec<u32>,
}

/// Health of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHealth {
    /// Network id.
    pub id: u32,
    /// Current health.
    pub current_health: u16,
}

/// Server health changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthUpdate {
    /// Server tick of the change.
    pub state_tick: u32,
    /// Changed entities.
    pub entities: Vec<EntityHealth>,
}

/// Inputs of a single player for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    /// Aim direction (unit vector).
    pub aim_direction: [f32; 2],
    /// Attack button held.
    pub is_attacking: bool,
    /// Jump button held.
    pub is_jumping: bool,
    /// Left movement held.
    pub is_moving_left: bool,
    /// Right movement held.
    pub is_moving_right: bool,
}

/// Inputs applied to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityInputs {
    /// Network id.
    pub id: u32,
    /// Applied inputs.
    pub inputs: InputData,
}

/// Server broadcast of the inputs driving remote entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitiesInputs {
    /// Server tick the inputs apply to.
    pub state_tick: u32,
    /// Per-entity inputs.
    pub entities: Vec<EntityInputs>,
}

/// Client inputs for each local player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayersInput {
    /// Tick the client expects the server to be at on arrival.
    pub estimated_server_tick: u32,
    /// One slot per local player; `None` if the player has no controlled
    /// entity this tick.
    pub inputs: Vec<Option<InputData>>,
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

/// Client asks for a client script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClientScriptRequest {
    /// Script path, as listed in [`MatchData::scripts`].
    pub path: String,
}

/// Script lookup result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptContent {
    /// The script bytes.
    Content(Vec<u8>),
    /// The server has no script at this path.
    NotFound,
}

/// Server answer to a [`DownloadClientScriptRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClientScriptResponse {
    /// Path of the requested script.
    pub path: String,
    /// Script bytes or a not-found marker.
    pub content: ScriptContent,
}

/// Client asks the server to stream a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClientFileRequest {
    /// Protocol-level key of the file.
    pub download_path: String,
}

/// Result of a file lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileResponse {
    /// The file exists; fragments follow.
    Found {
        /// Size of the file in bytes.
        file_size: u64,
        /// Size of every fragment except possibly the last.
        fragment_size: u32,
    },
    /// The server has no file at this path.
    NotFound,
}

/// Server answer to a [`DownloadClientFileRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClientFileResponse {
    /// Protocol-level key of the file.
    pub download_path: String,
    /// Lookup result.
    pub response: FileResponse,
}

/// One fixed-size piece of a file being streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClientFileFragment {
    /// Protocol-level key of the file.
    pub download_path: String,
    /// Index of the fragment within the file.
    pub fragment_index: u32,
    /// Fragment content.
    pub fragment_data: Vec<u8>,
}

impl_packet!(Auth, "Auth");
impl_packet!(AuthSuccess, "AuthSuccess");
impl_packet!(AuthFailure, "AuthFailure");
impl_packet!(MatchData, "MatchData");
impl_packet!(NetworkStrings, "NetworkStrings");
impl_packet!(CreateEntities, "CreateEntities");
impl_packet!(DeleteEntities, "DeleteEntities");
impl_packet!(HealthUpdate, "HealthUpdate");
impl_packet!(
    EntitiesInputs,
    "EntitiesInputs",
    PacketFlags::UNRELIABLE,
    CHANNEL_INPUTS
);
impl_packet!(
    PlayersInput,
    "PlayersInput",
    PacketFlags::UNRELIABLE,
    CHANNEL_INPUTS
);
impl_packet!(
    DownloadClientScriptRequest,
    "DownloadClientScriptRequest",
    PacketFlags::RELIABLE,
    CHANNEL_DOWNLOAD
);
impl_packet!(
    DownloadClientScriptResponse,
    "DownloadClientScriptResponse",
    PacketFlags::RELIABLE,
    CHANNEL_DOWNLOAD
);
impl_packet!(
    DownloadClientFileRequest,
    "DownloadClientFileRequest",
    PacketFlags::RELIABLE,
    CHANNEL_DOWNLOAD
);
impl_packet!(
    DownloadClientFileResponse,
    "DownloadClientFileResponse",
    PacketFlags::RELIABLE,
    CHANNEL_DOWNLOAD
);
impl_packet!(
    DownloadClientFileFragment,
    "DownloadClientFileFragment",
    PacketFlags::RELIABLE,
    CHANNEL_DOWNLOAD
);
impl_packet!(Ready, "Ready");

/// Protocol revision checked during [`Auth`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Build the match packet table. The registration order below defines the
/// wire opcodes; append new packets at the end.
pub fn match_protocol() -> PacketTable {
    PacketTable::new()
        .with::<Auth>()
        .with::<AuthSuccess>()
        .with::<AuthFailure>()
        .with::<MatchData>()
        .with::<NetworkStrings>()
        .with::<CreateEntities>()
        .with::<DeleteEntities>()
        .with::<HealthUpdate>()
        .with::<EntitiesInputs>()
        .with::<PlayersInput>()
        .with::<DownloadClientScriptRequest>()
        .with::<DownloadClientScriptResponse>()
        .with::<DownloadClientFileRequest>()
        .with::<DownloadClientFileResponse>()
        .with::<DownloadClientFileFragment>()
        .with::<Ready>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_follow_registration_order() {
        let table = match_protocol();
        assert_eq!(table.opcode_of::<Auth>(), Some(0));
        assert_eq!(table.opcode_of::<AuthSuccess>(), Some(1));
        assert_eq!(table.opcode_of::<Ready>(), Some(15));
        assert_eq!(table.len(), 16);
    }

    #[test]
    fn test_both_ends_agree_on_opcodes() {
        let client = match_protocol();
        let server = match_protocol();
        for (a, b) in client.iter().zip(server.iter()) {
            assert_eq!(a.name, b.name);
        }
        assert_eq!(
            client.opcode_by_name("DownloadClientFileFragment"),
            server.opcode_by_name("DownloadClientFileFragment")
        );
    }

    #[test]
    fn test_input_packets_are_unreliable() {
        assert!(!PlayersInput::FLAGS.is_reliable());
        assert_eq!(PlayersInput::CHANNEL, CHANNEL_INPUTS);
        assert!(DownloadClientFileFragment::FLAGS.is_reliable());
        assert_eq!(DownloadClientFileFragment::CHANNEL, CHANNEL_DOWNLOAD);
    }

    #[test]
    fn test_flags_bits() {
        let flags = PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED;
        assert!(flags.contains(PacketFlags::RELIABLE));
        assert_eq!(PacketFlags::from_bits_truncate(flags.bits()), flags);
        assert_eq!(PacketFlags::from_bits_truncate(0xff), flags);
    }
}
