//! Client-side prediction: a deterministic movement model, a private shadow
//! world replaying local inputs, and smoothing of server corrections.

pub mod movement;
pub mod prediction;
pub mod smoothing;

pub use movement::{
    MovementParams, MovementSnapshot, MovementState, PlayerSample, replay, step_movement,
};
pub use prediction::{
    Controller, Correction, DEFAULT_MAX_HISTORY, LocalMatchPrediction, NetworkId, PredictedInput,
    PredictionError,
};
pub use smoothing::CorrectionSmoothing;
