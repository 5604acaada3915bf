//! Client-side prediction of locally controlled entities.
//!
//! Each predicted entity has a shadow in a private [`World`] that nothing
//! else sees. Local inputs advance the shadows immediately and are kept in a
//! tick-ordered history together with the movement state they were applied
//! to. When the authoritative state for tick `T` arrives, history older than
//! `T` is dropped, the shadows are reset to the server state and the
//! remaining samples are replayed on top of it.

use std::collections::VecDeque;

use bevy_ecs::prelude::*;
use glam::Vec2;
use rustc_hash::FxHashMap;
use skirmish_protocol::packets::{InputData, PlayersInput};

use crate::movement::{MovementParams, MovementState, PlayerSample};

/// Default history length (~2 s at 60 Hz).
pub const DEFAULT_MAX_HISTORY: usize = 128;

/// Network id of a shadow entity.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u32);

/// Local player slot whose inputs drive a shadow entity.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Controller(pub u8);

/// Inputs of every local player for one server tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictedInput {
    /// Server tick the inputs apply to.
    pub server_tick: u32,
    /// One sample per local player, indexed by [`Controller`].
    pub inputs: Vec<PlayerSample>,
}

impl PredictedInput {
    fn sample_for(&self, controller: Controller) -> PlayerSample {
        self.inputs
            .get(usize::from(controller.0))
            .copied()
            .unwrap_or_default()
    }
}

impl From<PlayersInput> for PredictedInput {
    fn from(packet: PlayersInput) -> Self {
        Self {
            server_tick: packet.estimated_server_tick,
            inputs: packet
                .inputs
                .into_iter()
                .map(|input| PlayerSample::from(input.unwrap_or_default()))
                .collect(),
        }
    }
}

/// How reconciliation moved a shadow entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Network id of the entity.
    pub entity_id: u32,
    /// Corrected position minus previously predicted position.
    pub delta: Vec2,
    /// Newly predicted state.
    pub state: MovementState,
}

/// Errors raised by [`LocalMatchPrediction`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredictionError {
    /// Inputs must be pushed in non-decreasing tick order.
    #[error("input for tick {got} pushed after tick {last}")]
    TickRegression {
        /// Tick of the newest input in history.
        last: u32,
        /// Tick of the rejected input.
        got: u32,
    },
    /// The entity already has a shadow.
    #[error("entity {0} is already predicted")]
    AlreadyRegistered(u32),
}

/// Prediction sandbox of the local client.
pub struct LocalMatchPrediction {
    world: World,
    shadows: FxHashMap<u32, Entity>,
    history: VecDeque<PredictedInput>,
    params: MovementParams,
    max_history: usize,
}

impl LocalMatchPrediction {
    /// Create an empty sandbox.
    pub fn new(params: MovementParams, max_history: usize) -> Self {
        Self {
            world: World::new(),
            shadows: FxHashMap::default(),
            history: VecDeque::new(),
            params,
            max_history: max_history.max(1),
        }
    }

    /// Shadow `entity_id`, controlled by local player `controller`, starting
    /// from `state`.
    pub fn register_for_prediction(
        &mut self,
        entity_id: u32,
        controller: u8,
        state: MovementState,
    ) -> Result<(), PredictionError> {
        self.register_with(entity_id, controller, |shadow| {
            shadow.insert(state);
        })
    }

    /// Shadow `entity_id` built by `constructor`.
    ///
    /// The constructor may insert a [`MovementState`] and a per-entity
    /// [`MovementParams`]; a default state is used when it does not.
    pub fn register_with(
        &mut self,
        entity_id: u32,
        controller: u8,
        constructor: impl FnOnce(&mut EntityWorldMut<'_>),
    ) -> Result<(), PredictionError> {
        if self.shadows.contains_key(&entity_id) {
            return Err(PredictionError::AlreadyRegistered(entity_id));
        }

        let mut shadow = self
            .world
            .spawn((NetworkId(entity_id), Controller(controller)));
        constructor(&mut shadow);
        if !shadow.contains::<MovementState>() {
            shadow.insert(MovementState::default());
        }
        let shadow = shadow.id();

        self.shadows.insert(entity_id, shadow);
        tracing::debug!(
            entity = entity_id,
            controller,
            "entity registered for prediction"
        );
        Ok(())
    }

    /// Drop the shadow of a deleted entity. Unknown ids are ignored.
    pub fn on_entity_deletion(&mut self, entity_id: u32) {
        if let Some(shadow) = self.shadows.remove(&entity_id) {
            self.world.despawn(shadow);
            tracing::debug!(entity = entity_id, "prediction shadow removed");
        }
    }

    /// Record the local inputs of one tick and advance every shadow by it.
    ///
    /// Samples without a movement snapshot get the one of the shadow they
    /// drive, so replay stands on the same surface. A tick without any local
    /// player is ignored.
    pub fn push_input(&mut self, mut input: PredictedInput) -> Result<(), PredictionError> {
        if input.inputs.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.history.back()
            && input.server_tick < last.server_tick
        {
            return Err(PredictionError::TickRegression {
                last: last.server_tick,
                got: input.server_tick,
            });
        }

        let shadows: Vec<Entity> = self.shadows.values().copied().collect();
        for &shadow in &shadows {
            let (Some(controller), Some(state)) = (
                self.world.get::<Controller>(shadow).copied(),
                self.world.get::<MovementState>(shadow).copied(),
            ) else {
                continue;
            };
            if let Some(sample) = input.inputs.get_mut(usize::from(controller.0))
                && sample.movement.is_none()
            {
                sample.movement = Some(state.snapshot());
            }
        }
        for shadow in shadows {
            self.advance(shadow, &input);
        }

        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(input);
        Ok(())
    }

    /// Reconcile with the authoritative state of tick `tick`.
    ///
    /// Entities without a shadow are skipped. Returns one [`Correction`] per
    /// reconciled entity.
    pub fn reconcile(
        &mut self,
        tick: u32,
        authoritative: impl IntoIterator<Item = (u32, MovementState)>,
    ) -> Vec<Correction> {
        while self
            .history
            .front()
            .is_some_and(|entry| entry.server_tick < tick)
        {
            self.history.pop_front();
        }

        let mut corrections = Vec::new();
        for (entity_id, state) in authoritative {
            let Some(&shadow) = self.shadows.get(&entity_id) else {
                continue;
            };
            let Some(previous) = self.world.get::<MovementState>(shadow).copied() else {
                continue;
            };
            self.world.entity_mut(shadow).insert(state);

            let history = std::mem::take(&mut self.history);
            for entry in &history {
                self.advance(shadow, entry);
            }
            self.history = history;

            let Some(predicted) = self.world.get::<MovementState>(shadow).copied() else {
                continue;
            };
            corrections.push(Correction {
                entity_id,
                delta: predicted.position - previous.position,
                state: predicted,
            });
        }

        tracing::trace!(
            tick,
            replayed = self.history.len(),
            corrected = corrections.len(),
            "prediction reconciled"
        );
        corrections
    }

    /// Current predicted state of `entity_id`.
    pub fn predicted_state(&self, entity_id: u32) -> Option<MovementState> {
        let shadow = *self.shadows.get(&entity_id)?;
        self.world.get::<MovementState>(shadow).copied()
    }

    /// Ticks currently held in history, oldest first.
    pub fn history_ticks(&self) -> impl Iterator<Item = u32> + '_ {
        self.history.iter().map(|entry| entry.server_tick)
    }

    /// Number of predicted entities.
    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    /// Forget every shadow and the whole history.
    pub fn reset(&mut self) {
        self.world = World::new();
        self.shadows.clear();
        self.history.clear();
    }

    fn advance(&mut self, shadow: Entity, input: &PredictedInput) {
        let params = self
            .world
            .get::<MovementParams>(shadow)
            .copied()
            .unwrap_or(self.params);
        let Some(controller) = self.world.get::<Controller>(shadow).copied() else {
            return;
        };
        if let Some(mut state) = self.world.get_mut::<MovementState>(shadow) {
            let next = input.sample_for(controller).apply(&state, &params);
            *state = next;
        }
    }
}

impl Default for LocalMatchPrediction {
    fn default() -> Self {
        Self::new(MovementParams::default(), DEFAULT_MAX_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{MovementSnapshot, replay, step_movement};

    fn walking_input(tick: u32) -> InputData {
        InputData {
            is_moving_right: true,
            is_jumping: tick % 5 == 0,
            ..InputData::default()
        }
    }

    fn walking(tick: u32) -> PredictedInput {
        PredictedInput {
            server_tick: tick,
            inputs: vec![walking_input(tick).into()],
        }
    }

    #[test]
    fn test_push_input_moves_shadow_immediately() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .register_for_prediction(7, 0, MovementState::grounded_at(0.0))
            .unwrap();
        prediction.push_input(walking(1)).unwrap();

        let state = prediction.predicted_state(7).unwrap();
        assert!(state.position.x > 0.0);
    }

    #[test]
    fn test_reconcile_keeps_ticks_from_snapshot() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .register_for_prediction(1, 0, MovementState::grounded_at(0.0))
            .unwrap();
        for tick in 10..=15 {
            prediction.push_input(walking(tick)).unwrap();
        }

        let server = MovementState::grounded_at(40.0);
        let corrections = prediction.reconcile(12, [(1, server)]);

        assert_eq!(
            prediction.history_ticks().collect::<Vec<_>>(),
            vec![12, 13, 14, 15]
        );
        let stored: Vec<PlayerSample> = (12..=15).map(|t| walking_input(t).into()).collect();
        let expected = replay(&server, &stored, &MovementParams::default());
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].state, expected);
        assert_eq!(prediction.predicted_state(1), Some(expected));
    }

    #[test]
    fn test_matching_snapshot_produces_no_delta() {
        let mut prediction = LocalMatchPrediction::default();
        let start = MovementState::grounded_at(0.0);
        prediction.register_for_prediction(1, 0, start).unwrap();
        let mut server = start;
        prediction.push_input(walking(3)).unwrap();
        for tick in 3..8 {
            prediction.push_input(walking(tick + 1)).unwrap();
            server = step_movement(&server, &walking_input(tick), &MovementParams::default());
        }

        let corrections = prediction.reconcile(8, [(1, server)]);
        assert_eq!(corrections[0].delta, Vec2::ZERO);
    }

    #[test]
    fn test_replay_follows_surface_changes_in_history() {
        let mut prediction = LocalMatchPrediction::default();
        let start = MovementState::grounded_at(0.0);
        prediction.register_for_prediction(1, 0, start).unwrap();

        let ground = start.snapshot();
        let platform = MovementSnapshot {
            surface_velocity: Vec2::new(75.0, 0.0),
            friction: 0.4,
            ..ground
        };
        let samples: Vec<PlayerSample> = (10..16)
            .map(|tick| PlayerSample {
                input: InputData {
                    is_moving_left: tick % 2 == 0,
                    ..InputData::default()
                },
                movement: Some(if tick < 13 { ground } else { platform }),
            })
            .collect();
        for (tick, sample) in (10..16).zip(&samples) {
            prediction
                .push_input(PredictedInput {
                    server_tick: tick,
                    inputs: vec![*sample],
                })
                .unwrap();
        }
        let live = prediction.predicted_state(1).unwrap();

        let bare: Vec<PlayerSample> = samples.iter().map(|s| s.input.into()).collect();
        assert_ne!(replay(&start, &bare, &MovementParams::default()), live);

        let corrections = prediction.reconcile(10, [(1, start)]);
        assert_eq!(corrections[0].delta, Vec2::ZERO);
        assert_eq!(corrections[0].state, live);
    }

    #[test]
    fn test_recorded_surface_survives_reconcile() {
        let mut prediction = LocalMatchPrediction::default();
        let on_platform = MovementState {
            surface_velocity: Vec2::new(40.0, 0.0),
            ..MovementState::grounded_at(0.0)
        };
        prediction.register_for_prediction(1, 0, on_platform).unwrap();
        for tick in 0..4 {
            prediction
                .push_input(PredictedInput {
                    server_tick: tick,
                    inputs: vec![PlayerSample::default()],
                })
                .unwrap();
        }
        let live = prediction.predicted_state(1).unwrap();

        // The server does not know about the platform, the history does.
        let corrections = prediction.reconcile(0, [(1, MovementState::grounded_at(0.0))]);
        assert_eq!(corrections[0].state, live);
    }

    #[test]
    fn test_snapshot_older_than_history_replays_everything() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .register_for_prediction(1, 0, MovementState::grounded_at(0.0))
            .unwrap();
        for tick in 20..24 {
            prediction.push_input(walking(tick)).unwrap();
        }
        prediction.reconcile(5, [(1, MovementState::grounded_at(0.0))]);
        assert_eq!(prediction.history_ticks().count(), 4);
    }

    #[test]
    fn test_tick_regression_is_rejected() {
        let mut prediction = LocalMatchPrediction::default();
        prediction.push_input(walking(4)).unwrap();
        prediction.push_input(walking(4)).unwrap();
        assert_eq!(
            prediction.push_input(walking(3)),
            Err(PredictionError::TickRegression { last: 4, got: 3 })
        );
    }

    #[test]
    fn test_empty_sample_is_ignored() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .push_input(PredictedInput {
                server_tick: 9,
                inputs: Vec::new(),
            })
            .unwrap();
        assert_eq!(prediction.history_ticks().count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut prediction = LocalMatchPrediction::new(MovementParams::default(), 4);
        for tick in 0..10 {
            prediction.push_input(walking(tick)).unwrap();
        }
        assert_eq!(
            prediction.history_ticks().collect::<Vec<_>>(),
            vec![6, 7, 8, 9]
        );
    }

    #[test]
    fn test_deleted_entity_is_skipped() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .register_for_prediction(1, 0, MovementState::default())
            .unwrap();
        prediction.on_entity_deletion(1);
        prediction.push_input(walking(1)).unwrap();

        assert_eq!(prediction.predicted_state(1), None);
        assert!(
            prediction
                .reconcile(1, [(1, MovementState::default())])
                .is_empty()
        );
        prediction.on_entity_deletion(1);
    }

    #[test]
    fn test_constructor_can_override_params() {
        let mut prediction = LocalMatchPrediction::default();
        let slow = MovementParams {
            walk_speed: 10.0,
            ..MovementParams::default()
        };
        prediction
            .register_with(1, 0, |shadow| {
                shadow.insert((MovementState::grounded_at(0.0), slow));
            })
            .unwrap();
        prediction
            .register_for_prediction(2, 0, MovementState::grounded_at(0.0))
            .unwrap();
        for tick in 0..60 {
            prediction.push_input(walking(tick)).unwrap();
        }

        let slow_x = prediction.predicted_state(1).unwrap().position.x;
        let fast_x = prediction.predicted_state(2).unwrap().position.x;
        assert!(slow_x < fast_x);
        assert_eq!(
            prediction.register_for_prediction(1, 0, MovementState::default()),
            Err(PredictionError::AlreadyRegistered(1))
        );
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut prediction = LocalMatchPrediction::default();
        prediction
            .register_for_prediction(1, 0, MovementState::default())
            .unwrap();
        prediction.push_input(walking(1)).unwrap();
        prediction.reset();

        assert_eq!(prediction.shadow_count(), 0);
        assert_eq!(prediction.history_ticks().count(), 0);
        assert!(
            prediction
                .register_for_prediction(1, 0, MovementState::default())
                .is_ok()
        );
    }
}
