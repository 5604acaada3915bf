//! Fixed-timestep server loop.
//!
//! Wall-clock time is accumulated and consumed in whole ticks, so the match
//! advances at a constant rate whatever the sleep granularity of the host.

use std::time::{Duration, Instant};

use tracing::warn;

/// Longest frame accounted for; slower frames are clamped so a stalled
/// server does not try to catch up with dozens of ticks at once.
pub const MAX_FRAME_TIME: Duration = Duration::from_millis(250);

/// Accumulator turning elapsed time into a whole number of ticks.
#[derive(Debug)]
pub struct FixedTimestep {
    tick_duration: Duration,
    previous_time: Instant,
    accumulator: Duration,
    tick_count: u64,
}

impl FixedTimestep {
    /// Create a loop ticking every `tick_duration`, starting now.
    pub fn new(tick_duration: Duration) -> Self {
        Self {
            tick_duration: tick_duration.max(Duration::from_millis(1)),
            previous_time: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
        }
    }

    /// Measure the time since the previous call and run `update` once per
    /// elapsed tick.
    pub fn tick(&mut self, update: impl FnMut(u64)) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.previous_time);
        self.previous_time = now;
        self.advance(frame_time, update);
    }

    /// Account for `frame_time` and run `update` once per whole tick.
    pub fn advance(&mut self, frame_time: Duration, mut update: impl FnMut(u64)) {
        let frame_time = if frame_time > MAX_FRAME_TIME {
            warn!(
                "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                frame_time.as_secs_f64() * 1000.0,
                MAX_FRAME_TIME.as_secs_f64() * 1000.0
            );
            MAX_FRAME_TIME
        } else {
            frame_time
        };

        self.accumulator += frame_time;
        while self.accumulator >= self.tick_duration {
            update(self.tick_count);
            self.accumulator -= self.tick_duration;
            self.tick_count += 1;
        }
    }

    /// Time left before the next tick is due.
    pub fn time_until_next_tick(&self) -> Duration {
        self.tick_duration.saturating_sub(self.accumulator)
    }

    /// Number of ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    #[test]
    fn test_single_step() {
        let mut timestep = FixedTimestep::new(TICK);
        let mut ticks = Vec::new();
        timestep.advance(TICK, |t| ticks.push(t));
        assert_eq!(ticks, vec![0]);
        assert_eq!(timestep.time_until_next_tick(), TICK);
    }

    #[test]
    fn test_partial_frames_accumulate() {
        let mut timestep = FixedTimestep::new(TICK);
        let mut updates = 0;
        timestep.advance(Duration::from_millis(15), |_| updates += 1);
        assert_eq!(updates, 0);
        assert_eq!(timestep.time_until_next_tick(), Duration::from_millis(5));

        timestep.advance(Duration::from_millis(15), |_| updates += 1);
        assert_eq!(updates, 1);
        assert_eq!(timestep.time_until_next_tick(), Duration::from_millis(10));
    }

    #[test]
    fn test_multiple_steps_in_one_frame() {
        let mut timestep = FixedTimestep::new(TICK);
        let mut ticks = Vec::new();
        timestep.advance(TICK * 3, |t| ticks.push(t));
        assert_eq!(ticks, vec![0, 1, 2]);
        assert_eq!(timestep.tick_count(), 3);
    }

    #[test]
    fn test_long_frame_is_clamped() {
        let mut timestep = FixedTimestep::new(TICK);
        let mut updates = 0;
        timestep.advance(Duration::from_secs(5), |_| updates += 1);
        assert_eq!(updates, 250 / 20);
    }
}
