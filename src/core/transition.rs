//! Per-slot transition state machine.
//!
//! Sequences one assignment through its life:
//!
//! ```text
//! Idle -> PreviewLoading -> PreviewPlaying -> HandoffPending
//!      -> HandoffPrepared -> Transitioning -> DiagnosticActive
//! ```
//!
//! The machine is pure: every input returns the [`Effect`]s the owner must
//! carry out (cancel jobs, clear cache, start loads, notify renderers). It
//! never touches the queues itself, which keeps it single-threaded and lets
//! tests drive it with synthetic time.
//!
//! Hand-off happens only on a loop boundary: once the diagnostic tier is
//! `Done` the flag waits for the scheduler to wrap the preview to frame 0,
//! then the preview freezes on that frame and a fixed cross-fade runs to the
//! diagnostic surface showing the same frame.

use log::{debug, trace};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

use crate::entities::{InstanceKey, InstanceRef, SlotId};

/// Preview to diagnostic cross-fade length.
pub const CROSSFADE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Idle,
    PreviewLoading,
    PreviewPlaying,
    HandoffPending,
    HandoffPrepared,
    Transitioning,
    DiagnosticActive,
}

impl Phase {
    /// Preview frames are what the slot shows.
    pub fn shows_preview(self) -> bool {
        matches!(self, Self::PreviewPlaying | Self::HandoffPending | Self::HandoffPrepared)
    }

    /// Phases where the user may not pause.
    pub fn is_mid_handoff(self) -> bool {
        matches!(self, Self::HandoffPrepared | Self::Transitioning)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Rendering tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    Preview,
    Diagnostic,
}

/// What renderers read for one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotPlaybackState {
    pub slot: SlotId,
    pub phase: Phase,
    /// Owned by the scheduler while `is_playing`
    pub current_frame_index: usize,
    pub is_playing: bool,
    /// Diagnostic tier is `Done`; waiting for the next loop boundary
    pub pending_handoff: bool,
    pub frame_count: usize,
    /// Hand-off freeze: playing, but the scheduler must not advance
    pub frozen: bool,
    /// Scheduler bookkeeping, `None` until the next tick stamps it
    #[serde(skip)]
    pub(crate) last_advance: Option<Instant>,
}

impl SlotPlaybackState {
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            phase: Phase::Idle,
            current_frame_index: 0,
            is_playing: false,
            pending_handoff: false,
            frame_count: 0,
            frozen: false,
            last_advance: None,
        }
    }

    /// The scheduler may advance this slot.
    pub fn advances(&self) -> bool {
        self.is_playing && !self.frozen && self.frame_count > 0
    }
}

/// Work the machine's owner must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PhaseChanged { from: Phase, to: Phase },
    /// Cancel this slot's jobs in both queues
    CancelJobs,
    /// Drop both tiers' cached state for this slot
    ClearCache,
    LoadPreview { key: InstanceKey, instance: InstanceRef },
    LoadDiagnostic { key: InstanceKey, instance: InstanceRef },
    DiagnosticFrameReady { key: InstanceKey, index: usize },
}

/// Controller of one slot.
#[derive(Debug, Clone)]
pub struct SlotMachine {
    state: SlotPlaybackState,
    assignment: Option<(InstanceKey, InstanceRef)>,
    /// Diagnostic `Done` seen before preview playback started
    early_done: bool,
    fade_started: Option<Instant>,
    user_paused: bool,
}

impl SlotMachine {
    pub fn new(slot: SlotId) -> Self {
        Self {
            state: SlotPlaybackState::new(slot),
            assignment: None,
            early_done: false,
            fade_started: None,
            user_paused: false,
        }
    }

    pub fn state(&self) -> &SlotPlaybackState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SlotPlaybackState {
        &mut self.state
    }

    pub fn slot(&self) -> SlotId {
        self.state.slot
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn key(&self) -> Option<InstanceKey> {
        self.assignment.as_ref().map(|(k, _)| *k)
    }

    pub fn instance(&self) -> Option<&InstanceRef> {
        self.assignment.as_ref().map(|(_, i)| i)
    }

    fn is_current(&self, key: InstanceKey) -> bool {
        self.key() == Some(key)
    }

    fn set_phase(&mut self, to: Phase, effects: &mut Vec<Effect>) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        trace!("{}: {} -> {}", self.state.slot, from, to);
        self.state.phase = to;
        effects.push(Effect::PhaseChanged { from, to });
    }

    fn reset(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelJobs);
        effects.push(Effect::ClearCache);
        self.set_phase(Phase::Idle, effects);
        let slot = self.state.slot;
        self.state = SlotPlaybackState::new(slot);
        self.assignment = None;
        self.early_done = false;
        self.fade_started = None;
        self.user_paused = false;
    }

    /// Assign an instance, replacing any current one. Mints a fresh key.
    pub fn assign(&mut self, instance: InstanceRef) -> (InstanceKey, Vec<Effect>) {
        let mut effects = Vec::new();
        self.reset(&mut effects);

        let key = InstanceKey::new();
        self.state.frame_count = instance.frame_count;
        self.assignment = Some((key, instance.clone()));
        self.set_phase(Phase::PreviewLoading, &mut effects);
        effects.push(Effect::LoadPreview { key, instance });
        (key, effects)
    }

    /// Clear the slot. No-op when already idle and empty.
    pub fn clear(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.assignment.is_none() && self.state.phase == Phase::Idle {
            return effects;
        }
        self.reset(&mut effects);
        effects
    }

    /// Preview tier decoded its frames: start playback and the diagnostic load.
    pub fn preview_ready(&mut self, key: InstanceKey) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.is_current(key) || self.state.phase != Phase::PreviewLoading {
            debug!("{}: ignoring preview ready for key={} in {}", self.state.slot, key, self.state.phase);
            return effects;
        }

        self.state.current_frame_index = 0;
        self.state.is_playing = !self.user_paused;
        self.state.last_advance = None;
        self.set_phase(Phase::PreviewPlaying, &mut effects);

        if let Some((key, instance)) = self.assignment.clone() {
            effects.push(Effect::LoadDiagnostic { key, instance });
        }

        if self.early_done {
            self.early_done = false;
            self.state.pending_handoff = true;
            self.set_phase(Phase::HandoffPending, &mut effects);
        }
        effects
    }

    /// Diagnostic tier is `Done` for `key`.
    pub fn diagnostic_done(&mut self, key: InstanceKey) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.is_current(key) {
            return effects;
        }
        match self.state.phase {
            Phase::PreviewPlaying => {
                self.state.pending_handoff = true;
                self.set_phase(Phase::HandoffPending, &mut effects);
            }
            Phase::PreviewLoading => self.early_done = true,
            _ => {}
        }
        effects
    }

    /// Scheduler wrapped this slot to frame 0.
    pub fn loop_wrapped(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.phase != Phase::HandoffPending || !self.state.pending_handoff {
            return effects;
        }
        let Some(key) = self.key() else {
            return effects;
        };

        self.state.frozen = true;
        self.state.last_advance = None;
        self.set_phase(Phase::HandoffPrepared, &mut effects);
        effects.push(Effect::DiagnosticFrameReady { key, index: self.state.current_frame_index });

        self.fade_started = Some(now);
        self.set_phase(Phase::Transitioning, &mut effects);
        effects
    }

    /// Time-driven transitions (cross-fade completion).
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.phase != Phase::Transitioning {
            return effects;
        }
        let Some(started) = self.fade_started else {
            return effects;
        };
        if now.saturating_duration_since(started) < CROSSFADE {
            return effects;
        }

        self.fade_started = None;
        self.state.frozen = false;
        self.state.pending_handoff = false;
        self.state.current_frame_index = 0;
        self.state.last_advance = None;
        self.state.is_playing = !self.user_paused;
        self.set_phase(Phase::DiagnosticActive, &mut effects);
        effects
    }

    /// Stop advancing. Refused mid-handoff and when nothing is assigned.
    pub fn pause(&mut self) -> bool {
        if self.assignment.is_none() || self.state.phase.is_mid_handoff() {
            debug!("{}: pause refused in {}", self.state.slot, self.state.phase);
            return false;
        }
        self.user_paused = true;
        self.state.is_playing = false;
        self.state.last_advance = None;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.assignment.is_none() || self.state.phase.is_mid_handoff() {
            debug!("{}: resume refused in {}", self.state.slot, self.state.phase);
            return false;
        }
        self.user_paused = false;
        if matches!(self.state.phase, Phase::PreviewPlaying | Phase::HandoffPending | Phase::DiagnosticActive) {
            self.state.is_playing = true;
        }
        true
    }

    /// Jump to a frame. Only while paused.
    pub fn seek(&mut self, index: usize) -> bool {
        let playable = matches!(
            self.state.phase,
            Phase::PreviewPlaying | Phase::HandoffPending | Phase::DiagnosticActive
        );
        if !playable || self.state.is_playing || index >= self.state.frame_count {
            return false;
        }
        self.state.current_frame_index = index;
        true
    }

    /// 0.0 shows the preview, 1.0 the diagnostic surface.
    pub fn crossfade_alpha(&self, now: Instant) -> f32 {
        match self.state.phase {
            Phase::DiagnosticActive => 1.0,
            Phase::Transitioning => self
                .fade_started
                .map(|s| (now.saturating_duration_since(s).as_secs_f32() / CROSSFADE.as_secs_f32()).min(1.0))
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn preview_playing(&self) -> bool {
        self.state.is_playing && self.state.phase.shows_preview()
    }

    pub fn diagnostic_playing(&self) -> bool {
        self.state.is_playing && self.state.phase == Phase::DiagnosticActive
    }

    pub fn visible_tier(&self) -> Option<Tier> {
        match self.state.phase {
            Phase::Idle | Phase::PreviewLoading => None,
            Phase::Transitioning | Phase::DiagnosticActive => Some(Tier::Diagnostic),
            _ => Some(Tier::Preview),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inst(frames: usize) -> InstanceRef {
        InstanceRef::new("st", "se", "sop", frames)
    }

    fn phases(effects: &[Effect]) -> Vec<(Phase, Phase)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::PhaseChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_lifecycle() {
        let t0 = Instant::now();
        let mut m = SlotMachine::new(SlotId::new(0));

        let (key, effects) = m.assign(inst(30));
        assert_eq!(phases(&effects), vec![(Phase::Idle, Phase::PreviewLoading)]);
        assert!(matches!(effects.last(), Some(Effect::LoadPreview { .. })));

        let effects = m.preview_ready(key);
        assert_eq!(m.phase(), Phase::PreviewPlaying);
        assert!(m.preview_playing());
        assert!(effects.iter().any(|e| matches!(e, Effect::LoadDiagnostic { key: k, .. } if *k == key)));

        m.diagnostic_done(key);
        assert_eq!(m.phase(), Phase::HandoffPending);
        assert!(m.state().pending_handoff);
        assert!(m.state().is_playing);

        let effects = m.loop_wrapped(t0);
        assert_eq!(
            phases(&effects),
            vec![(Phase::HandoffPending, Phase::HandoffPrepared), (Phase::HandoffPrepared, Phase::Transitioning)]
        );
        assert!(effects.contains(&Effect::DiagnosticFrameReady { key, index: 0 }));
        assert!(m.state().frozen);

        assert!(m.tick(t0 + Duration::from_millis(199)).is_empty());
        assert!((m.crossfade_alpha(t0 + Duration::from_millis(100)) - 0.5).abs() < 1e-3);

        let effects = m.tick(t0 + CROSSFADE);
        assert_eq!(phases(&effects), vec![(Phase::Transitioning, Phase::DiagnosticActive)]);
        assert!(!m.preview_playing());
        assert!(m.diagnostic_playing());
        assert!(!m.state().frozen);
        assert_eq!(m.crossfade_alpha(t0 + CROSSFADE), 1.0);
    }

    #[test]
    fn test_wrap_without_done_keeps_playing_preview() {
        let mut m = SlotMachine::new(SlotId::new(1));
        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        assert!(m.loop_wrapped(Instant::now()).is_empty());
        assert_eq!(m.phase(), Phase::PreviewPlaying);
    }

    #[test]
    fn test_stale_key_is_ignored() {
        let mut m = SlotMachine::new(SlotId::new(0));
        let (old, _) = m.assign(inst(5));
        let (new, effects) = m.assign(inst(5));
        assert_ne!(old, new);
        assert!(effects.contains(&Effect::CancelJobs));
        assert!(effects.contains(&Effect::ClearCache));

        assert!(m.preview_ready(old).is_empty());
        assert_eq!(m.phase(), Phase::PreviewLoading);
        m.preview_ready(new);
        assert!(m.diagnostic_done(old).is_empty());
        assert_eq!(m.phase(), Phase::PreviewPlaying);
    }

    #[test]
    fn test_reassign_from_playing_goes_through_idle() {
        let mut m = SlotMachine::new(SlotId::new(0));
        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        let (_, effects) = m.assign(inst(9));
        assert_eq!(
            phases(&effects),
            vec![(Phase::PreviewPlaying, Phase::Idle), (Phase::Idle, Phase::PreviewLoading)]
        );
        assert_eq!(m.state().frame_count, 9);
        assert!(!m.state().is_playing);
    }

    #[test]
    fn test_early_done_applies_on_preview_ready() {
        let mut m = SlotMachine::new(SlotId::new(0));
        let (key, _) = m.assign(inst(5));
        assert!(m.diagnostic_done(key).is_empty());
        assert_eq!(m.phase(), Phase::PreviewLoading);

        let effects = m.preview_ready(key);
        assert_eq!(m.phase(), Phase::HandoffPending);
        assert_eq!(
            phases(&effects),
            vec![(Phase::PreviewLoading, Phase::PreviewPlaying), (Phase::PreviewPlaying, Phase::HandoffPending)]
        );
    }

    #[test]
    fn test_pause_rules() {
        let t0 = Instant::now();
        let mut m = SlotMachine::new(SlotId::new(0));
        assert!(!m.pause());

        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        assert!(m.pause());
        assert_eq!(m.phase(), Phase::PreviewPlaying);
        assert!(!m.state().is_playing);
        assert!(m.seek(3));
        assert!(!m.seek(5));
        assert!(m.resume());
        assert!(m.state().is_playing);
        assert!(!m.seek(1));

        m.diagnostic_done(key);
        m.loop_wrapped(t0);
        assert_eq!(m.phase(), Phase::Transitioning);
        assert!(!m.pause());
        assert!(m.state().is_playing);
    }

    #[test]
    fn test_pause_while_loading_carries_into_playback() {
        let mut m = SlotMachine::new(SlotId::new(0));
        let (key, _) = m.assign(inst(5));
        assert!(m.pause());
        m.preview_ready(key);
        assert_eq!(m.phase(), Phase::PreviewPlaying);
        assert!(!m.state().is_playing);
    }

    #[test]
    fn test_reassign_drops_pause() {
        let mut m = SlotMachine::new(SlotId::new(0));
        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        assert!(m.pause());
        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        assert!(m.state().is_playing);
    }

    #[test]
    fn test_clear() {
        let mut m = SlotMachine::new(SlotId::new(2));
        assert!(m.clear().is_empty());
        let (key, _) = m.assign(inst(5));
        m.preview_ready(key);
        let effects = m.clear();
        assert_eq!(phases(&effects), vec![(Phase::PreviewPlaying, Phase::Idle)]);
        assert_eq!(m.key(), None);
        assert_eq!(m.state().frame_count, 0);
    }

    #[derive(Debug, Clone)]
    enum Input {
        Assign(usize),
        PreviewReady { stale: bool },
        DiagnosticDone { stale: bool },
        Wrap,
        Tick(u64),
        Pause,
        Resume,
        Clear,
    }

    fn input() -> impl Strategy<Value = Input> {
        prop_oneof![
            (1usize..40).prop_map(Input::Assign),
            any::<bool>().prop_map(|stale| Input::PreviewReady { stale }),
            any::<bool>().prop_map(|stale| Input::DiagnosticDone { stale }),
            Just(Input::Wrap),
            (0u64..400).prop_map(Input::Tick),
            Just(Input::Pause),
            Just(Input::Resume),
            Just(Input::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_handoff_needs_preview_and_done(inputs in proptest::collection::vec(input(), 0..60)) {
            let mut m = SlotMachine::new(SlotId::new(0));
            let mut now = Instant::now();
            let mut keys: Vec<InstanceKey> = Vec::new();
            let mut preview_seen = false;
            let mut done_seen = false;

            for input in inputs {
                let before = m.phase();
                match input {
                    Input::Assign(frames) => {
                        let (key, _) = m.assign(inst(frames));
                        keys.push(key);
                        preview_seen = false;
                        done_seen = false;
                    }
                    Input::PreviewReady { stale } => {
                        let key = if stale { keys.first().copied() } else { m.key() };
                        if let Some(key) = key {
                            let current = m.key() == Some(key);
                            m.preview_ready(key);
                            if current && before == Phase::PreviewLoading {
                                preview_seen = true;
                            }
                        }
                    }
                    Input::DiagnosticDone { stale } => {
                        let key = if stale { keys.first().copied() } else { m.key() };
                        if let Some(key) = key {
                            if m.key() == Some(key) {
                                done_seen = true;
                            }
                            m.diagnostic_done(key);
                        }
                    }
                    Input::Wrap => { m.loop_wrapped(now); }
                    Input::Tick(ms) => {
                        now += Duration::from_millis(ms);
                        m.tick(now);
                    }
                    Input::Pause => { m.pause(); }
                    Input::Resume => { m.resume(); }
                    Input::Clear => {
                        m.clear();
                        preview_seen = false;
                        done_seen = false;
                    }
                }

                let phase = m.phase();
                if matches!(phase, Phase::HandoffPending | Phase::HandoffPrepared | Phase::Transitioning | Phase::DiagnosticActive) {
                    prop_assert!(preview_seen && done_seen, "{:?} reached without both preconditions", phase);
                }
                if phase == Phase::HandoffPending {
                    prop_assert!(m.state().pending_handoff);
                }
                // Never back to a preview phase without a new assignment
                if before == Phase::DiagnosticActive {
                    prop_assert!(matches!(phase, Phase::DiagnosticActive | Phase::Idle | Phase::PreviewLoading));
                }
                if m.state().frame_count > 0 {
                    prop_assert!(m.state().current_frame_index < m.state().frame_count);
                }
            }
        }
    }
}
