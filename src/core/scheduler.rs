//! Shared animation clock for every slot of a session.
//!
//! # Timing Model
//!
//! FPS-based: one frame interval is `1/fps` seconds, shared by all slots.
//! Each `tick(now)` looks at every eligible slot and, once a full interval has
//! elapsed since its last advance, moves it exactly one frame forward. The
//! sub-interval remainder is carried so the long-run rate stays on target;
//! missed intervals are not caught up (one frame per slot per tick).
//!
//! A slot that just started (or resumed, or unfroze) is only stamped on its
//! first tick, so playback never jumps by the time it spent stopped.

use log::{info, trace};
use std::time::{Duration, Instant};

use crate::core::transition::SlotPlaybackState;
use crate::entities::SlotId;

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 60;

/// One frame step of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAdvance {
    pub slot: SlotId,
    pub index: usize,
    /// Advance crossed the loop boundary back to frame 0
    pub wrapped: bool,
}

#[derive(Debug, Clone)]
pub struct AnimationScheduler {
    fps: u32,
    interval: Duration,
}

impl AnimationScheduler {
    pub fn new(fps: u32) -> Self {
        let fps = fps.clamp(MIN_FPS, MAX_FPS);
        Self { fps, interval: Self::interval_for(fps) }
    }

    fn interval_for(fps: u32) -> Duration {
        Duration::from_nanos(1_000_000_000 / fps as u64)
    }

    /// Change the shared rate (clamped to 1..=60). Applies on the next tick.
    pub fn set_target_frame_rate(&mut self, fps: u32) {
        let fps = fps.clamp(MIN_FPS, MAX_FPS);
        if fps != self.fps {
            info!("Target frame rate: {} -> {} fps", self.fps, fps);
            self.fps = fps;
            self.interval = Self::interval_for(fps);
        }
    }

    pub fn target_frame_rate(&self) -> u32 {
        self.fps
    }

    pub fn frame_interval(&self) -> Duration {
        self.interval
    }

    /// Advance every eligible slot whose interval elapsed.
    ///
    /// Paused, frozen or empty slots lose their timestamp so they restart
    /// cleanly when they become eligible again.
    pub fn tick<'a>(
        &self,
        now: Instant,
        slots: impl IntoIterator<Item = &'a mut SlotPlaybackState>,
    ) -> Vec<FrameAdvance> {
        let mut advances = Vec::new();

        for state in slots {
            if !state.advances() {
                state.last_advance = None;
                continue;
            }

            let Some(last) = state.last_advance else {
                state.last_advance = Some(now);
                continue;
            };

            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.interval {
                continue;
            }

            let next = (state.current_frame_index + 1) % state.frame_count;
            state.current_frame_index = next;

            let remainder = Duration::from_nanos((elapsed.as_nanos() % self.interval.as_nanos()) as u64);
            state.last_advance = Some(now - remainder);

            trace!("{} -> frame {}", state.slot, next);
            advances.push(FrameAdvance { slot: state.slot, index: next, wrapped: next == 0 });
        }

        advances
    }
}

impl Default for AnimationScheduler {
    fn default() -> Self {
        Self::new(30)
    }
}
