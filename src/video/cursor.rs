//! Playback cursor and restart detection
//!
//! The clock glue keeps the cursor it last applied to the pipeline and
//! compares it with each tick's request. A restart is needed whenever the new
//! request is not the natural continuation of the old one.

use serde::{Deserialize, Serialize};

/// Differences below this are float noise, not discontinuities
const CURSOR_TOLERANCE: f64 = 1e-6;

/// What happens when playback runs past either end of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    /// Hold the last (or first) frame
    #[default]
    None,
    /// Wrap around to the other end
    Loop,
    /// Reflect back and forth
    PingPong,
}

impl From<bool> for LoopMode {
    fn from(looping: bool) -> Self {
        if looping {
            LoopMode::Loop
        } else {
            LoopMode::None
        }
    }
}

impl LoopMode {
    /// Map a clock time into `[0, duration]`
    ///
    /// `Loop` treats the end as exclusive, so `duration` itself wraps to 0.
    pub fn wrap_time(self, time: f64, duration: f64) -> f64 {
        if !(duration > 0.0) || !time.is_finite() {
            return 0.0;
        }
        match self {
            LoopMode::None => time.clamp(0.0, duration),
            LoopMode::Loop => time.rem_euclid(duration),
            LoopMode::PingPong => {
                let period = duration * 2.0;
                let t = time.rem_euclid(period);
                if t > duration {
                    period - t
                } else {
                    t
                }
            }
        }
    }
}

/// Playback direction, from the sign of the per-tick delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Paused,
}

impl Direction {
    pub fn from_delta(delta: f64) -> Self {
        if delta > 0.0 {
            Direction::Forward
        } else if delta < 0.0 {
            Direction::Backward
        } else {
            Direction::Paused
        }
    }
}

/// Requested playback time plus the signed step expected before the next tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackCursor {
    pub time: f64,
    pub delta: f64,
}

impl PlaybackCursor {
    pub fn new(time: f64, delta: f64) -> Self {
        Self { time, delta }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_delta(self.delta)
    }

    /// Time the next tick should request if playback continues unchanged
    pub fn expected_next(&self) -> f64 {
        self.time + self.delta
    }
}

/// Why the pipeline must restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Nothing applied yet
    Initial,
    /// Time jumped away from the expected continuation
    Seek,
    SpeedChange,
    DirectionChange,
    /// Loop policy changed, so the same time may map to another frame
    LoopModeChange,
}

/// Compare the applied cursor with a new request
///
/// Returns `None` when `requested` continues `applied` (same delta, time
/// advanced by exactly one delta).
pub fn detect_restart(
    applied: Option<&PlaybackCursor>,
    requested: &PlaybackCursor,
) -> Option<RestartReason> {
    let Some(applied) = applied else {
        return Some(RestartReason::Initial);
    };

    if (requested.delta - applied.delta).abs() > CURSOR_TOLERANCE {
        let flipped = matches!(
            (applied.direction(), requested.direction()),
            (Direction::Forward, Direction::Backward) | (Direction::Backward, Direction::Forward)
        );
        return Some(if flipped {
            RestartReason::DirectionChange
        } else {
            RestartReason::SpeedChange
        });
    }

    if (requested.time - applied.expected_next()).abs() > CURSOR_TOLERANCE {
        return Some(RestartReason::Seek);
    }

    None
}
