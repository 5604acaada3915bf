//! Visual smoothing of prediction corrections.
//!
//! The logical position snaps to the corrected value immediately; the
//! rendered position carries an offset that decays exponentially, so small
//! corrections are not visible as jumps.

use glam::Vec2;

/// Corrections shorter than this are smoothed; longer ones snap.
pub const SMALL_CORRECTION_THRESHOLD: f32 = 48.0;

/// Default exponential decay rate of the visual offset, per second.
pub const DEFAULT_DECAY_RATE: f32 = 10.0;

/// Offsets shorter than this are dropped.
const MIN_OFFSET: f32 = 0.05;

/// Decaying visual offset of one predicted entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionSmoothing {
    /// Offset of the rendered position from the logical one.
    pub visual_offset: Vec2,
    /// Exponential decay rate per second.
    pub decay_rate: f32,
    /// Corrections at least this long snap instantly.
    pub snap_threshold: f32,
}

impl Default for CorrectionSmoothing {
    fn default() -> Self {
        Self {
            visual_offset: Vec2::ZERO,
            decay_rate: DEFAULT_DECAY_RATE,
            snap_threshold: SMALL_CORRECTION_THRESHOLD,
        }
    }
}

impl CorrectionSmoothing {
    /// Smoothing with a custom decay rate.
    pub fn new(decay_rate: f32) -> Self {
        Self {
            decay_rate,
            ..Self::default()
        }
    }

    /// Record a correction of the logical position by `delta`.
    pub fn apply_correction(&mut self, delta: Vec2) {
        if delta.length_squared() < self.snap_threshold * self.snap_threshold {
            // The rendered position stays where it was.
            self.visual_offset -= delta;
        } else {
            self.visual_offset = Vec2::ZERO;
        }
    }

    /// Decay the offset over `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        self.visual_offset *= (-self.decay_rate * dt).exp();
        if self.visual_offset.length_squared() < MIN_OFFSET * MIN_OFFSET {
            self.visual_offset = Vec2::ZERO;
        }
    }

    /// Returns `true` if nothing is left to smooth.
    pub fn is_zero(&self) -> bool {
        self.visual_offset == Vec2::ZERO
    }

    /// Position to render for an entity logically at `position`.
    pub fn rendered_position(&self, position: Vec2) -> Vec2 {
        position + self.visual_offset
    }
}
