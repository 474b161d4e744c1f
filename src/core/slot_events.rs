//! Per-slot playback events.
//!
//! Emitted by the session on its `EventBus` from inside `tick()`.

use crate::core::preload::PreloadProgress;
use crate::core::transition::{Phase, Tier};
use crate::entities::{InstanceKey, SlotId};

/// Scheduler moved a slot to a new frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAdvanced {
    pub slot: SlotId,
    pub index: usize,
    /// True when this advance wrapped to frame 0
    pub wrapped: bool,
}

/// Slot entered a new phase.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseChanged {
    pub slot: SlotId,
    pub from: Phase,
    pub to: Phase,
}

/// Preload progress of one tier changed.
#[derive(Clone, Debug, PartialEq)]
pub struct PreloadProgressChanged {
    pub tier: Tier,
    pub progress: PreloadProgress,
}

/// A load failed; the slot keeps its phase and stays assignable.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotFailed {
    pub slot: SlotId,
    pub tier: Tier,
    pub message: String,
}

/// Diagnostic surface should show `index` for the assignment `key`.
/// Sent once at hand-off, with the first frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticFrameReady {
    pub slot: SlotId,
    pub key: InstanceKey,
    pub index: usize,
}
