//! Authoritative match: session bookkeeping, request handling and the
//! per-tick simulation of player movement.
//!
//! Packet handlers only see the session they were received on, so they
//! forward requests through a channel and the server acts on them after
//! [`MatchSessions::poll`] returns.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;
use skirmish_config::Config;
use skirmish_download::{FileFragmentServer, FragmentServerConfig};
use skirmish_prediction::{MovementParams, MovementState, step_movement};
use skirmish_protocol::packets::{
    Auth, AuthFailure, AuthSuccess, CreateEntities, DeleteEntities, DownloadClientFileFragment,
    DownloadClientFileRequest, DownloadClientFileResponse, DownloadClientScriptRequest,
    DownloadClientScriptResponse, EntitiesInputs, EntityCreation, EntityInputs, InputData,
    MatchData, NetworkStrings, PlayersInput, Ready, RemoteFile,
};
use skirmish_protocol::{
    CommandStore, NetworkStringStore, PROTOCOL_VERSION, Packet, ProtocolError, match_protocol,
};
use skirmish_session::{
    LocalSessionBridge, MatchClientSession, MatchSessions, SessionEvent, SessionHandle,
    SessionManager,
};

use crate::assets::ScriptLibrary;

/// Disconnect code sent when authentication fails.
pub const DISCONNECT_AUTH_FAILED: u32 = 1;

/// Most local players a single client may bring.
pub const MAX_LOCAL_PLAYERS: usize = 4;

/// Most players in a match; player indices travel as `u8`.
pub const MAX_PLAYERS: usize = 256;

/// Entity class of player-controlled entities.
const PLAYER_CLASS: &str = "player";

/// Horizontal distance between spawn points.
const SPAWN_SPACING: f32 = 64.0;

/// A request decoded by a packet handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// [`Auth`] packet.
    Auth(Auth),
    /// [`Ready`] packet.
    Ready,
    /// [`PlayersInput`] packet.
    Inputs(PlayersInput),
    /// [`DownloadClientFileRequest`] packet.
    File(DownloadClientFileRequest),
    /// [`DownloadClientScriptRequest`] packet.
    Script(DownloadClientScriptRequest),
}

/// Static description of the match.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Display name.
    pub match_name: String,
    /// Gamemode name.
    pub gamemode: String,
    /// Map name.
    pub map: String,
    /// Duration of a tick in milliseconds.
    pub tick_duration_ms: u32,
    /// HTTP mirrors advertised to clients.
    pub asset_base_urls: Vec<String>,
    /// Movement model of player entities.
    pub movement: MovementParams,
    /// Maximum number of sessions.
    pub max_sessions: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            match_name: "Skirmish".to_string(),
            gamemode: "deathmatch".to_string(),
            map: "arena".to_string(),
            tick_duration_ms: 16,
            asset_base_urls: Vec::new(),
            movement: MovementParams::default(),
            max_sessions: 32,
        }
    }
}

impl MatchSettings {
    /// Settings described by a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let prediction = &config.prediction;
        let tick_duration = prediction.tick_duration();
        Self {
            match_name: config.server.match_name.clone(),
            gamemode: config.server.gamemode.clone(),
            map: config.server.map.clone(),
            tick_duration_ms: tick_duration.as_millis() as u32,
            asset_base_urls: config.download.asset_base_urls.clone(),
            movement: MovementParams {
                gravity: prediction.gravity,
                walk_speed: prediction.walk_speed,
                ground_acceleration: prediction.ground_acceleration,
                air_acceleration: prediction.air_acceleration,
                jump_speed: prediction.jump_speed,
                max_jump_time: prediction.max_jump_time,
                friction: prediction.friction,
                tick_duration: tick_duration.as_secs_f32(),
            },
            max_sessions: config.network.max_sessions,
        }
    }
}

/// Build the server command store, forwarding requests into `requests`.
pub fn server_commands(
    requests: Sender<(SessionHandle, ClientRequest)>,
) -> Result<CommandStore<MatchClientSession>, ProtocolError> {
    fn forward<T: Packet>(
        commands: &mut CommandStore<MatchClientSession>,
        requests: &Sender<(SessionHandle, ClientRequest)>,
        wrap: fn(T) -> ClientRequest,
    ) -> Result<(), ProtocolError> {
        let requests = requests.clone();
        commands.on_incoming::<T, _>(move |session, packet| {
            // The receiver lives as long as the server owning the store.
            let _ = requests.send((session.handle(), wrap(packet)));
        })
    }

    let mut commands = CommandStore::new(Arc::new(match_protocol()));
    forward(&mut commands, &requests, ClientRequest::Auth)?;
    forward::<Ready>(&mut commands, &requests, |_| ClientRequest::Ready)?;
    forward(&mut commands, &requests, ClientRequest::Inputs)?;
    forward(&mut commands, &requests, ClientRequest::File)?;
    forward(&mut commands, &requests, ClientRequest::Script)?;

    commands.enable_outgoing::<AuthSuccess>()?;
    commands.enable_outgoing::<AuthFailure>()?;
    commands.enable_outgoing::<MatchData>()?;
    commands.enable_outgoing::<NetworkStrings>()?;
    commands.enable_outgoing::<CreateEntities>()?;
    commands.enable_outgoing::<DeleteEntities>()?;
    commands.enable_outgoing::<EntitiesInputs>()?;
    commands.enable_outgoing::<DownloadClientScriptResponse>()?;
    commands.enable_outgoing::<DownloadClientFileResponse>()?;
    commands.enable_outgoing::<DownloadClientFileFragment>()?;
    Ok(commands)
}

struct Client {
    player_indices: Vec<u8>,
    ready: bool,
}

struct Player {
    owner: SessionHandle,
    entity_id: Option<u32>,
    input: InputData,
    state: MovementState,
}

/// The authoritative side of a match.
pub struct MatchServer {
    sessions: MatchSessions,
    requests: Receiver<(SessionHandle, ClientRequest)>,
    settings: MatchSettings,
    strings: NetworkStringStore,
    files: FileFragmentServer<SessionHandle>,
    assets: Vec<RemoteFile>,
    scripts: ScriptLibrary,
    clients: FxHashMap<SessionHandle, Client>,
    players: Vec<Option<Player>>,
    next_entity_id: u32,
    tick: u32,
}

impl MatchServer {
    /// Create a match without any transport.
    pub fn new(
        settings: MatchSettings,
        files: FileFragmentServer<SessionHandle>,
        scripts: ScriptLibrary,
    ) -> Result<Self, ProtocolError> {
        let (tx, requests) = crossbeam_channel::unbounded();
        let sessions = MatchSessions::new(server_commands(tx)?, settings.max_sessions);

        let mut strings = NetworkStringStore::new();
        strings.register_string(PLAYER_CLASS);

        Ok(Self {
            sessions,
            requests,
            assets: files.remote_files(),
            settings,
            strings,
            files,
            scripts,
            clients: FxHashMap::default(),
            players: Vec::new(),
            next_entity_id: 1,
            tick: 0,
        })
    }

    /// Add a transport.
    pub fn add_manager(&mut self, manager: Box<dyn SessionManager>) {
        self.sessions.add_manager(manager);
    }

    /// Open an in-process session and return its client half.
    pub fn create_local_session(&mut self) -> Option<LocalSessionBridge> {
        self.sessions.create_local_session()
    }

    /// Current server tick.
    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of players in the match.
    pub fn player_count(&self) -> usize {
        self.players.iter().flatten().count()
    }

    /// Run one server tick.
    pub fn update(&mut self) {
        self.sessions.poll();

        while let Some(event) = self.sessions.poll_event() {
            match event {
                SessionEvent::Created { id, .. } => {
                    tracing::info!(session = id.0, "client connected");
                }
                SessionEvent::Deleted { handle, id, data } => {
                    tracing::info!(session = id.0, data, "client disconnected");
                    self.remove_client(handle);
                }
            }
        }

        while let Ok((handle, request)) = self.requests.try_recv() {
            self.handle_request(handle, request);
        }

        self.simulate();

        for (handle, fragment) in self.files.update() {
            self.send(handle, &fragment);
        }
        self.tick = self.tick.wrapping_add(1);
    }

    fn handle_request(&mut self, handle: SessionHandle, request: ClientRequest) {
        if self.sessions.session(handle).is_none() {
            return;
        }
        match request {
            ClientRequest::Auth(auth) => self.on_auth(handle, auth),
            ClientRequest::Ready => self.on_ready(handle),
            ClientRequest::Inputs(inputs) => self.on_inputs(handle, inputs),
            ClientRequest::File(request) => {
                let response = self.files.handle_request(handle, request);
                self.send(handle, &response);
            }
            ClientRequest::Script(request) => {
                let content = self.scripts.content(&request.path);
                let response = DownloadClientScriptResponse {
                    path: request.path,
                    content,
                };
                self.send(handle, &response);
            }
        }
    }

    fn on_auth(&mut self, handle: SessionHandle, auth: Auth) {
        if self.clients.contains_key(&handle) {
            tracing::warn!(?handle, "client authenticated twice");
            return;
        }
        if let Err(reason) = self.check_auth(&auth) {
            tracing::info!(?handle, %reason, "authentication refused");
            self.send(handle, &AuthFailure { reason });
            self.sessions.disconnect_session(handle, DISCONNECT_AUTH_FAILED);
            return;
        }

        let first_new_string = self.strings.len() as u32;
        let mut player_indices = Vec::with_capacity(auth.players.len());
        for name in &auth.players {
            self.strings.register_string(name);
            let player = Player {
                owner: handle,
                entity_id: None,
                input: InputData::default(),
                state: MovementState::default(),
            };
            let index = match self.players.iter().position(Option::is_none) {
                Some(free) => {
                    self.players[free] = Some(player);
                    free
                }
                None => {
                    self.players.push(Some(player));
                    self.players.len() - 1
                }
            };
            player_indices.push(index as u8);
        }

        if self.strings.len() as u32 > first_new_string {
            let update = self.strings.build_packet(first_new_string);
            let others: Vec<_> = self.clients.keys().copied().collect();
            for other in others {
                self.send(other, &update);
            }
        }

        let session_id = self
            .sessions
            .session(handle)
            .map(|s| s.id().0)
            .unwrap_or_default();
        tracing::info!(session = session_id, players = ?auth.players, "client authenticated");

        self.send(
            handle,
            &AuthSuccess {
                session_id,
                player_indices: player_indices.clone(),
            },
        );
        let match_data = self.match_data();
        self.send(handle, &match_data);
        let strings = self.strings.build_packet(0);
        self.send(handle, &strings);

        self.clients.insert(
            handle,
            Client {
                player_indices,
                ready: false,
            },
        );
    }

    fn check_auth(&self, auth: &Auth) -> Result<(), String> {
        if auth.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {} does not match server version {}",
                auth.protocol_version, PROTOCOL_VERSION
            ));
        }
        if auth.players.is_empty() || auth.players.len() > MAX_LOCAL_PLAYERS {
            return Err(format!(
                "between 1 and {MAX_LOCAL_PLAYERS} players are allowed per client"
            ));
        }
        let free = self.players.iter().filter(|p| p.is_none()).count()
            + MAX_PLAYERS.saturating_sub(self.players.len());
        if auth.players.len() > free {
            return Err("match is full".to_string());
        }
        Ok(())
    }

    fn on_ready(&mut self, handle: SessionHandle) {
        let Some(client) = self.clients.get_mut(&handle) else {
            tracing::warn!(?handle, "ready before authentication");
            return;
        };
        if client.ready {
            return;
        }
        client.ready = true;
        let indices = client.player_indices.clone();

        let class_id = self.strings.register_string(PLAYER_CLASS);
        let mut spawned = Vec::new();
        for index in indices {
            let entity_id = self.next_entity_id;
            let Some(player) = self.players.get_mut(usize::from(index)).and_then(Option::as_mut)
            else {
                continue;
            };
            self.next_entity_id += 1;
            player.entity_id = Some(entity_id);
            player.state = MovementState::grounded_at(f32::from(index) * SPAWN_SPACING);
            spawned.push(Self::creation(class_id, index, entity_id, &player.state));
        }

        let existing: Vec<EntityCreation> = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(index, player)| {
                let player = player.as_ref()?;
                let entity_id = player.entity_id?;
                Some(Self::creation(class_id, index as u8, entity_id, &player.state))
            })
            .collect();
        self.send(
            handle,
            &CreateEntities {
                state_tick: self.tick,
                entities: existing,
            },
        );

        let announce = CreateEntities {
            state_tick: self.tick,
            entities: spawned,
        };
        for other in self.ready_clients() {
            if other != handle {
                self.send(other, &announce);
            }
        }
    }

    fn on_inputs(&mut self, handle: SessionHandle, inputs: PlayersInput) {
        let Some(client) = self.clients.get(&handle) else {
            return;
        };
        for (slot, input) in inputs.inputs.into_iter().enumerate() {
            let Some(&index) = client.player_indices.get(slot) else {
                break;
            };
            if let Some(player) = self.players.get_mut(usize::from(index)).and_then(Option::as_mut) {
                player.input = input.unwrap_or_default();
            }
        }
    }

    fn remove_client(&mut self, handle: SessionHandle) {
        self.files.cancel_requester(handle);
        let Some(client) = self.clients.remove(&handle) else {
            return;
        };

        let mut removed = Vec::new();
        for index in client.player_indices {
            if let Some(slot) = self.players.get_mut(usize::from(index))
                && let Some(player) = slot.take()
                && let Some(entity_id) = player.entity_id
            {
                debug_assert_eq!(player.owner, handle);
                removed.push(entity_id);
            }
        }
        if removed.is_empty() {
            return;
        }

        let packet = DeleteEntities {
            state_tick: self.tick,
            entities: removed,
        };
        for other in self.ready_clients() {
            self.send(other, &packet);
        }
    }

    fn simulate(&mut self) {
        let mut entities = Vec::new();
        for player in self.players.iter_mut().flatten() {
            let Some(entity_id) = player.entity_id else {
                continue;
            };
            player.state = step_movement(&player.state, &player.input, &self.settings.movement);
            entities.push(EntityInputs {
                id: entity_id,
                inputs: player.input,
            });
        }
        if entities.is_empty() {
            return;
        }

        let packet = EntitiesInputs {
            state_tick: self.tick,
            entities,
        };
        for handle in self.ready_clients() {
            self.send(handle, &packet);
        }
    }

    fn match_data(&self) -> MatchData {
        MatchData {
            match_name: self.settings.match_name.clone(),
            gamemode: self.settings.gamemode.clone(),
            map: self.settings.map.clone(),
            tick_duration_ms: self.settings.tick_duration_ms,
            current_tick: self.tick,
            assets: self.assets.clone(),
            scripts: self.scripts.remote_files(),
            asset_base_urls: self.settings.asset_base_urls.clone(),
        }
    }

    fn creation(class_id: u32, owner: u8, entity_id: u32, state: &MovementState) -> EntityCreation {
        EntityCreation {
            id: entity_id,
            class_id,
            position: state.position.to_array(),
            rotation: 0.0,
            health: Some((100, 100)),
            owner: Some(owner),
        }
    }

    fn ready_clients(&self) -> Vec<SessionHandle> {
        self.clients
            .iter()
            .filter(|(_, client)| client.ready)
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn send<T: Packet>(&mut self, handle: SessionHandle, packet: &T) {
        if let Err(err) = self.sessions.send_packet(handle, packet) {
            tracing::warn!(?handle, packet = T::NAME, %err, "failed to send packet");
        }
    }
}
