//! Deterministic player movement shared by prediction and the server.
//!
//! The model is a side-view platformer: horizontal speed eases toward the
//! walk target (or toward rest under friction), pressing jump gives a fixed
//! upward speed that is held while the button stays down for at most
//! [`MovementParams::max_jump_time`], and gravity pulls everything back to
//! the ground plane at `y = 0`. A jump starts only on the press edge, so
//! holding the button through a landing does not bounce.
//!
//! Only plain `f32` arithmetic in a fixed order is used, so identical inputs
//! produce bit-identical states on every replay.

use bevy_ecs::prelude::*;
use glam::Vec2;
use serde::{Deserialize, Serialize};
use skirmish_protocol::packets::InputData;

/// Tunables of the movement model. Also usable as a per-entity override.
#[derive(Component, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementParams {
    /// Downward acceleration, units/s².
    pub gravity: f32,
    /// Target horizontal speed while a direction is held, units/s.
    pub walk_speed: f32,
    /// Horizontal acceleration on the ground, units/s².
    pub ground_acceleration: f32,
    /// Horizontal acceleration in the air, units/s².
    pub air_acceleration: f32,
    /// Upward speed given by a jump, units/s.
    pub jump_speed: f32,
    /// How long holding jump keeps the upward speed, seconds.
    pub max_jump_time: f32,
    /// Horizontal deceleration on the ground with no direction held,
    /// units/s². Scaled by [`MovementState::friction`].
    pub friction: f32,
    /// Duration of one simulation tick, seconds.
    pub tick_duration: f32,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            gravity: 1_200.0,
            walk_speed: 250.0,
            ground_acceleration: 2_000.0,
            air_acceleration: 600.0,
            jump_speed: 420.0,
            max_jump_time: 0.2,
            friction: 2_400.0,
            tick_duration: 1.0 / 60.0,
        }
    }
}

/// Kinematic state of a moving entity.
#[derive(Component, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementState {
    /// World position; `y` grows upward.
    pub position: Vec2,
    /// Velocity, units/s.
    pub velocity: Vec2,
    /// Whether the entity stands on the ground.
    pub on_ground: bool,
    /// Jump button state of the previous tick.
    pub was_jumping: bool,
    /// Time spent in the current jump.
    pub jump_time: f32,
    /// Velocity of the surface the entity stands on (moving platforms).
    pub surface_velocity: Vec2,
    /// Grip of the surface the entity stands on; 1 is regular ground.
    pub friction: f32,
}

impl Default for MovementState {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            on_ground: false,
            was_jumping: false,
            jump_time: 0.0,
            surface_velocity: Vec2::ZERO,
            friction: 1.0,
        }
    }
}

impl MovementState {
    /// Entity standing still on the ground at `x`.
    pub fn grounded_at(x: f32) -> Self {
        Self {
            position: Vec2::new(x, 0.0),
            on_ground: true,
            ..Self::default()
        }
    }

    /// Controller flags and surface of this state, without its kinematics.
    pub fn snapshot(&self) -> MovementSnapshot {
        MovementSnapshot {
            surface_velocity: self.surface_velocity,
            was_jumping: self.was_jumping,
            on_ground: self.on_ground,
            jump_time: self.jump_time,
            friction: self.friction,
        }
    }

    /// Put the entity back on the surface recorded in `snapshot`.
    ///
    /// Only the surface is restored; the controller flags keep whatever the
    /// state already holds, so an authoritative correction survives replay.
    pub fn apply_surface(&mut self, snapshot: &MovementSnapshot) {
        self.surface_velocity = snapshot.surface_velocity;
        self.friction = snapshot.friction;
    }
}

/// Movement state recorded alongside an input, as sampled before the input
/// was applied.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementSnapshot {
    /// Velocity of the surface under the entity.
    pub surface_velocity: Vec2,
    /// Jump button state of the previous tick.
    pub was_jumping: bool,
    /// Whether the entity stood on the ground.
    pub on_ground: bool,
    /// Time spent in the current jump.
    pub jump_time: f32,
    /// Grip of the surface under the entity.
    pub friction: f32,
}

fn move_towards(current: f32, target: f32, max_delta: f32) -> f32 {
    if (target - current).abs() <= max_delta {
        target
    } else {
        current + (target - current).signum() * max_delta
    }
}

/// Advance `state` by one tick under `input`.
pub fn step_movement(
    state: &MovementState,
    input: &InputData,
    params: &MovementParams,
) -> MovementState {
    let dt = params.tick_duration;
    let mut next = *state;

    let direction = match (input.is_moving_left, input.is_moving_right) {
        (true, false) => -1.0,
        (false, true) => 1.0,
        _ => 0.0,
    };
    let target = direction * params.walk_speed;
    let acceleration = match (state.on_ground, direction == 0.0) {
        (true, true) => params.friction * state.friction,
        (true, false) => params.ground_acceleration * state.friction,
        (false, _) => params.air_acceleration,
    };
    next.velocity.x = move_towards(state.velocity.x, target, acceleration * dt);

    let pressed = input.is_jumping && !state.was_jumping;
    if pressed && state.on_ground {
        next.velocity.y = params.jump_speed;
        next.jump_time = 0.0;
        next.on_ground = false;
    } else if input.is_jumping && !state.on_ground && state.jump_time < params.max_jump_time {
        next.velocity.y = params.jump_speed;
        next.jump_time = state.jump_time + dt;
    } else {
        if !state.on_ground {
            // Releasing the button ends the jump for good.
            next.jump_time = params.max_jump_time;
        }
        next.velocity.y = state.velocity.y - params.gravity * dt;
    }
    next.was_jumping = input.is_jumping;

    let carried = if state.on_ground {
        state.surface_velocity
    } else {
        Vec2::ZERO
    };
    next.position = state.position + (next.velocity + carried) * dt;

    if next.position.y <= 0.0 {
        next.position.y = 0.0;
        next.velocity.y = next.velocity.y.max(0.0);
        next.on_ground = next.velocity.y == 0.0;
        if next.on_ground {
            next.jump_time = 0.0;
        }
    } else {
        next.on_ground = false;
    }
    if !next.on_ground {
        next.surface_velocity = Vec2::ZERO;
    }
    next
}

/// Input of one player for one tick, with the movement state it was
/// sampled against.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlayerSample {
    /// Applied input.
    pub input: InputData,
    /// Movement state before the input, when known.
    pub movement: Option<MovementSnapshot>,
}

impl PlayerSample {
    /// Advance `state` by this sample, standing on its recorded surface.
    pub fn apply(&self, state: &MovementState, params: &MovementParams) -> MovementState {
        let mut state = *state;
        if let Some(movement) = &self.movement {
            state.apply_surface(movement);
        }
        step_movement(&state, &self.input, params)
    }
}

impl From<InputData> for PlayerSample {
    fn from(input: InputData) -> Self {
        Self {
            input,
            movement: None,
        }
    }
}

/// Apply `samples` in order starting from `snapshot`.
pub fn replay<'a>(
    snapshot: &MovementState,
    samples: impl IntoIterator<Item = &'a PlayerSample>,
    params: &MovementParams,
) -> MovementState {
    samples
        .into_iter()
        .fold(*snapshot, |state, sample| sample.apply(&state, params))
}
