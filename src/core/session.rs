//! Viewer session - the one object a host drives.
//!
//! Owns the frame cache, both preload queues, the worker pool, the shared
//! scheduler and one [`SlotMachine`] per grid cell (arena indexed by
//! [`SlotId`]). Everything is scoped to the session: dropping it (or calling
//! [`ViewerSession::shutdown`]) cancels every job and releases every cached
//! raster.
//!
//! # Threading
//!
//! Slot state lives on the host thread. Worker callbacks never touch it; they
//! post [`PipelineMsg`]s onto a channel that `tick()` drains before advancing
//! the clock, so a completion and the next frame step are always ordered.
//!
//! # Typical loop
//!
//! ```ignore
//! let mut session = ViewerSession::new(config, source, surface)?;
//! session.assign(SlotId::new(0), instance)?;
//! loop {
//!     session.tick(Instant::now());
//!     for slot in session.slots() { draw(slot, session.preview_frame(slot.slot)); }
//! }
//! ```

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{GridLayout, ViewerConfig};
use crate::core::diagnostic::{DiagnosticQueue, DiagnosticSurface};
use crate::core::event_bus::EventBus;
use crate::core::frame_cache::FrameCache;
use crate::core::preload::{
    CompleteFn, JobOutcome, MAX_CONCURRENT_LIMIT, PipelineSettings, PreloadPipeline, PreloadProgress, ProgressFn,
};
use crate::core::scheduler::AnimationScheduler;
use crate::core::slot_events::{DiagnosticFrameReady, FrameAdvanced, PhaseChanged, PreloadProgressChanged, SlotFailed};
use crate::core::source::FrameSource;
use crate::core::transition::{Effect, Phase, SlotMachine, SlotPlaybackState, Tier};
use crate::core::workers::Workers;
use crate::entities::{InstanceKey, InstanceRef, Raster, SlotId};
use crate::error::{EngineError, Result};

/// Error affordance shown on a slot whose load failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotError {
    pub tier: Tier,
    pub message: String,
}

/// Worker → session message.
enum PipelineMsg {
    Progress { tier: Tier, key: InstanceKey, progress: PreloadProgress },
    Complete { tier: Tier, outcome: JobOutcome },
}

pub struct ViewerSession {
    config: ViewerConfig,
    machines: Vec<SlotMachine>,
    errors: Vec<Option<SlotError>>,
    cache: Arc<FrameCache>,
    preload: PreloadPipeline,
    diagnostic: DiagnosticQueue,
    surface: Arc<dyn DiagnosticSurface>,
    scheduler: AnimationScheduler,
    events: EventBus,
    tx: Sender<PipelineMsg>,
    rx: Receiver<PipelineMsg>,
    shut_down: bool,
}

impl ViewerSession {
    pub fn new(
        config: ViewerConfig,
        source: Arc<dyn FrameSource>,
        surface: Arc<dyn DiagnosticSurface>,
    ) -> Result<Self> {
        let config = config.clamped();
        let workers = Arc::new(Workers::new(Workers::recommended(MAX_CONCURRENT_LIMIT), "cinegrid-worker")?);
        let cache = Arc::new(FrameCache::new());

        let preload = PreloadPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&source),
            Arc::clone(&workers),
            config.max_concurrent_preloads,
        );
        preload.set_settings(pipeline_settings(&config));

        let diagnostic = DiagnosticQueue::new(
            Arc::clone(&cache),
            source,
            Arc::clone(&surface),
            workers,
            config.batch_size,
        );

        let (tx, rx) = crossbeam_channel::unbounded();
        let slot_count = config.layout.slot_count();

        info!(
            "Viewer session: layout {}, {} fps, preview {}px, {} concurrent preloads",
            config.layout,
            config.target_frame_rate,
            config.preview_resolution.pixels(),
            config.max_concurrent_preloads
        );

        Ok(Self {
            scheduler: AnimationScheduler::new(config.target_frame_rate),
            machines: (0..slot_count).map(|i| SlotMachine::new(SlotId::new(i))).collect(),
            errors: vec![None; slot_count],
            config,
            cache,
            preload,
            diagnostic,
            surface,
            events: EventBus::new(),
            tx,
            rx,
            shut_down: false,
        })
    }

    // ========== Slot mutators ==========

    /// Assign an instance to a slot, replacing whatever it showed.
    ///
    /// Cancels the slot's jobs in both queues, clears its cache and starts the
    /// preview load. Returns the new assignment key.
    pub fn assign(&mut self, slot: SlotId, instance: InstanceRef) -> Result<InstanceKey> {
        if self.shut_down {
            return Err(EngineError::config("session is shut down"));
        }
        if instance.frame_count == 0 {
            return Err(EngineError::config(format!("{} has no frames", instance.sop_instance_id)));
        }
        let machine = self.machine_mut(slot)?;

        info!("{}: assign {}", slot, instance);
        let (key, effects) = machine.assign(instance);
        self.apply(slot, effects);
        Ok(key)
    }

    /// Clear a slot back to `Idle`. False if the slot is unknown or already empty.
    pub fn clear(&mut self, slot: SlotId) -> bool {
        let Ok(machine) = self.machine_mut(slot) else {
            return false;
        };
        let effects = machine.clear();
        let changed = !effects.is_empty();
        self.apply(slot, effects);
        changed
    }

    /// Pause a slot. No-op (false) mid-handoff.
    pub fn pause(&mut self, slot: SlotId) -> bool {
        self.machine_mut(slot).map(SlotMachine::pause).unwrap_or(false)
    }

    pub fn resume(&mut self, slot: SlotId) -> bool {
        self.machine_mut(slot).map(SlotMachine::resume).unwrap_or(false)
    }

    /// Jump a paused slot to `index`.
    pub fn seek(&mut self, slot: SlotId, index: usize) -> bool {
        self.machine_mut(slot).map(|m| m.seek(index)).unwrap_or(false)
    }

    // ========== Clock ==========

    /// Drain worker messages, finish cross-fades, advance frames.
    pub fn tick(&mut self, now: Instant) {
        if self.shut_down {
            return;
        }
        self.process_pending();

        for i in 0..self.machines.len() {
            let effects = self.machines[i].tick(now);
            if !effects.is_empty() {
                self.apply(SlotId::new(i), effects);
            }
        }

        let advances = self.scheduler.tick(now, self.machines.iter_mut().map(SlotMachine::state_mut));
        for adv in advances {
            self.events.emit(FrameAdvanced { slot: adv.slot, index: adv.index, wrapped: adv.wrapped });
            if adv.wrapped {
                let effects = self.machines[adv.slot.index()].loop_wrapped(now);
                self.apply(adv.slot, effects);
            }
        }
    }

    /// Apply queued progress and completion reports. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let messages: Vec<PipelineMsg> = self.rx.try_iter().collect();
        let count = messages.len();

        for msg in messages {
            match msg {
                PipelineMsg::Progress { tier, key, progress } => {
                    if self.is_current(progress.slot, key) {
                        self.events.emit(PreloadProgressChanged { tier, progress });
                    }
                }
                PipelineMsg::Complete { tier, outcome } => self.on_complete(tier, outcome),
            }
        }
        count
    }

    fn on_complete(&mut self, tier: Tier, outcome: JobOutcome) {
        let JobOutcome { slot, key, success, loaded, error } = outcome;
        if !self.is_current(slot, key) {
            trace!("{}: dropping {:?} completion for stale key={}", slot, tier, key);
            return;
        }

        if !success {
            let message = error.map(|e| e.to_string()).unwrap_or_else(|| "load failed".to_string());
            warn!("{}: {:?} load failed: {}", slot, tier, message);
            self.errors[slot.index()] = Some(SlotError { tier, message: message.clone() });
            self.events.emit(SlotFailed { slot, tier, message });
            return;
        }

        debug!("{}: {:?} tier done ({} frames)", slot, tier, loaded);
        let machine = &mut self.machines[slot.index()];
        let effects = match tier {
            Tier::Preview => machine.preview_ready(key),
            Tier::Diagnostic => machine.diagnostic_done(key),
        };
        self.apply(slot, effects);
    }

    fn apply(&mut self, slot: SlotId, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::PhaseChanged { from, to } => {
                    debug!("{}: {} -> {}", slot, from, to);
                    self.events.emit(PhaseChanged { slot, from, to });
                }
                Effect::CancelJobs => {
                    self.preload.cancel(slot);
                    self.diagnostic.cancel(slot);
                }
                Effect::ClearCache => {
                    self.cache.clear(slot);
                    self.surface.release(slot);
                    self.errors[slot.index()] = None;
                }
                Effect::LoadPreview { key, instance } => {
                    let (on_progress, on_complete) = self.callbacks(Tier::Preview, key);
                    self.preload.enqueue(slot, key, instance, on_progress, on_complete);
                }
                Effect::LoadDiagnostic { key, instance } => {
                    let (on_progress, on_complete) = self.callbacks(Tier::Diagnostic, key);
                    self.diagnostic.enqueue(slot, key, instance, on_progress, on_complete);
                }
                Effect::DiagnosticFrameReady { key, index } => {
                    self.events.emit(DiagnosticFrameReady { slot, key, index });
                }
            }
        }
    }

    fn callbacks(&self, tier: Tier, key: InstanceKey) -> (ProgressFn, CompleteFn) {
        let tx = self.tx.clone();
        let on_progress: ProgressFn = Arc::new(move |progress| {
            let _ = tx.send(PipelineMsg::Progress { tier, key, progress });
        });
        let tx = self.tx.clone();
        let on_complete: CompleteFn = Box::new(move |outcome| {
            let _ = tx.send(PipelineMsg::Complete { tier, outcome });
        });
        (on_progress, on_complete)
    }

    // ========== Configuration ==========

    /// Apply a new configuration. A layout with a different slot count
    /// flushes every slot; everything else applies on the next tick/enqueue.
    pub fn set_config(&mut self, config: ViewerConfig) {
        let config = config.clamped();

        if config.layout.slot_count() != self.config.layout.slot_count() {
            info!("Layout {} -> {}: flushing all slots", self.config.layout, config.layout);
            self.flush();
            let n = config.layout.slot_count();
            self.machines = (0..n).map(|i| SlotMachine::new(SlotId::new(i))).collect();
            self.errors = vec![None; n];
        }

        self.scheduler.set_target_frame_rate(config.target_frame_rate);
        self.preload.set_max_concurrent(config.max_concurrent_preloads);
        self.preload.set_settings(pipeline_settings(&config));
        self.diagnostic.set_batch_size(config.batch_size);
        self.config = config;
    }

    pub fn set_layout(&mut self, layout: GridLayout) {
        self.set_config(ViewerConfig { layout, ..self.config.clone() });
    }

    pub fn set_target_frame_rate(&mut self, fps: u32) {
        self.set_config(ViewerConfig { target_frame_rate: fps, ..self.config.clone() });
    }

    pub fn set_max_concurrent_preloads(&mut self, max: usize) {
        self.set_config(ViewerConfig { max_concurrent_preloads: max, ..self.config.clone() });
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn frame_interval(&self) -> Duration {
        self.scheduler.frame_interval()
    }

    // ========== Renderer view ==========

    pub fn slot_count(&self) -> usize {
        self.machines.len()
    }

    pub fn slots(&self) -> impl Iterator<Item = &SlotPlaybackState> {
        self.machines.iter().map(SlotMachine::state)
    }

    pub fn slot(&self, slot: SlotId) -> Option<&SlotPlaybackState> {
        self.machine(slot).map(SlotMachine::state)
    }

    pub fn phase(&self, slot: SlotId) -> Option<Phase> {
        self.machine(slot).map(SlotMachine::phase)
    }

    pub fn instance_key(&self, slot: SlotId) -> Option<InstanceKey> {
        self.machine(slot).and_then(SlotMachine::key)
    }

    pub fn preview_playing(&self, slot: SlotId) -> bool {
        self.machine(slot).is_some_and(SlotMachine::preview_playing)
    }

    pub fn diagnostic_playing(&self, slot: SlotId) -> bool {
        self.machine(slot).is_some_and(SlotMachine::diagnostic_playing)
    }

    /// Preview raster for the slot's current frame. Falls back to the last
    /// decoded frame before it so a missing frame never blanks the cell.
    pub fn preview_frame(&self, slot: SlotId) -> Option<Raster> {
        let machine = self.machine(slot)?;
        let key = machine.key()?;
        let index = machine.state().current_frame_index;
        (0..=index).rev().find_map(|i| self.cache.frame(slot, key, i))
    }

    pub fn crossfade_alpha(&self, slot: SlotId, now: Instant) -> f32 {
        self.machine(slot).map(|m| m.crossfade_alpha(now)).unwrap_or(0.0)
    }

    pub fn slot_error(&self, slot: SlotId) -> Option<&SlotError> {
        self.errors.get(slot.index()).and_then(Option::as_ref)
    }

    pub fn progress(&self, slot: SlotId, tier: Tier) -> Option<PreloadProgress> {
        match tier {
            Tier::Preview => self.preload.progress(slot),
            Tier::Diagnostic => self.diagnostic.progress(slot),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    // ========== Lifecycle ==========

    fn flush(&mut self) {
        for i in 0..self.machines.len() {
            let effects = self.machines[i].clear();
            self.apply(SlotId::new(i), effects);
        }
        self.preload.cancel_all();
        self.diagnostic.cancel_all();
        self.cache.clear_all();
        // Anything still queued belongs to cancelled jobs
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            trace!("Flush dropped {} pending messages", dropped);
        }
    }

    /// Cancel all jobs and release every cached image. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.flush();
        self.shut_down = true;
        let stats = self.cache.stats();
        info!(
            "Viewer session shut down (cache hits {}, misses {}, hit rate {:.1}%)",
            stats.hits(),
            stats.misses(),
            stats.hit_rate() * 100.0
        );
    }

    fn machine(&self, slot: SlotId) -> Option<&SlotMachine> {
        self.machines.get(slot.index())
    }

    fn machine_mut(&mut self, slot: SlotId) -> Result<&mut SlotMachine> {
        let count = self.machines.len();
        self.machines
            .get_mut(slot.index())
            .ok_or_else(|| EngineError::config(format!("{} outside {}-slot layout", slot, count)))
    }

    fn is_current(&self, slot: SlotId, key: InstanceKey) -> bool {
        self.machine(slot).and_then(SlotMachine::key) == Some(key)
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pipeline_settings(config: &ViewerConfig) -> PipelineSettings {
    PipelineSettings {
        resolution: config.preview_resolution.pixels(),
        batch_size: config.batch_size,
        whole_instance: config.whole_instance_preview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostic::LoggingSurface;
    use crate::core::preload::PreloadState;
    use crate::core::preload::test_util::wait_until;
    use crate::core::source::fake::FakeSource;
    use crate::core::transition::CROSSFADE;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    fn inst(sop: &str, frames: usize) -> InstanceRef {
        InstanceRef::new("1.2", "1.2.3", sop, frames)
    }

    fn session(source: FakeSource, config: ViewerConfig) -> ViewerSession {
        ViewerSession::new(config, Arc::new(source), Arc::new(LoggingSurface)).unwrap()
    }

    fn record_phases(session: &ViewerSession) -> Arc<Mutex<Vec<(Phase, Phase)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        session.events().subscribe::<PhaseChanged, _>(move |e| s.lock().unwrap().push((e.from, e.to)));
        seen
    }

    #[test]
    fn test_handoff_scenario_30_frames_2x2() {
        let (source, gate) = FakeSource::gated();
        let config = ViewerConfig { layout: GridLayout::Quad, target_frame_rate: 30, ..Default::default() };
        let mut session = session(source.with_whole_instance(), config);
        let phases = record_phases(&session);
        let ready = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&ready);
        session.events().subscribe::<DiagnosticFrameReady, _>(move |e| r.lock().unwrap().push(e.index));

        let slot = SlotId::new(0);
        let step = session.frame_interval();
        let t0 = Instant::now();

        let key = session.assign(slot, inst("1.2.3.4", 30)).unwrap();
        assert_eq!(session.phase(slot), Some(Phase::PreviewLoading));

        // Preview comes in one whole-instance request
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(slot) == Some(Phase::PreviewPlaying)
        }));
        assert_eq!(session.cache().get(slot).len(), 30);
        assert!(session.preview_playing(slot));

        for k in 1..=10u32 {
            session.tick(t0 + step * k);
        }
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(10));

        // Diagnostic batches (4 x 8 frames) are held at the gate until now
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        let mid = t0 + step * 10;
        assert!(wait_until(|| {
            session.tick(mid);
            session.phase(slot) == Some(Phase::HandoffPending)
        }));
        assert_eq!(
            session.slot(slot).map(|s| (s.current_frame_index, s.is_playing, s.pending_handoff)),
            Some((10, true, true))
        );
        assert_eq!(session.cache().diagnostic_frames(slot, key).len(), 30);

        for k in 11..=29u32 {
            session.tick(t0 + step * k);
            assert_eq!(session.phase(slot), Some(Phase::HandoffPending));
        }
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(29));

        let wrap_at = t0 + step * 30;
        session.tick(wrap_at);
        assert_eq!(session.phase(slot), Some(Phase::Transitioning));
        assert_eq!(session.slot(slot).map(|s| (s.current_frame_index, s.frozen)), Some((0, true)));
        assert_eq!(*ready.lock().unwrap(), vec![0]);
        {
            let phases = phases.lock().unwrap();
            let tail: Vec<_> = phases.iter().rev().take(2).rev().copied().collect();
            assert_eq!(
                tail,
                vec![(Phase::HandoffPending, Phase::HandoffPrepared), (Phase::HandoffPrepared, Phase::Transitioning)]
            );
        }

        // Frozen for the whole fade
        session.tick(wrap_at + Duration::from_millis(100));
        assert_eq!(session.phase(slot), Some(Phase::Transitioning));
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(0));
        assert!(!session.pause(slot));

        session.tick(wrap_at + CROSSFADE);
        assert_eq!(session.phase(slot), Some(Phase::DiagnosticActive));
        assert!(!session.preview_playing(slot));
        assert!(session.diagnostic_playing(slot));
        assert_eq!(session.crossfade_alpha(slot, wrap_at + CROSSFADE), 1.0);
    }

    #[test]
    fn test_reassign_during_preview_playback() {
        let (source, gate) = FakeSource::gated();
        let mut session = session(source.with_whole_instance(), ViewerConfig::default());
        let slot = SlotId::new(1);
        let t0 = Instant::now();

        let first = session.assign(slot, inst("a", 30)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(slot) == Some(Phase::PreviewPlaying)
        }));
        // First instance's diagnostic job now sits at the gate
        assert!(wait_until(|| {
            session.progress(slot, Tier::Diagnostic).map(|p| p.state) == Some(PreloadState::Loading)
        }));

        let phases = record_phases(&session);
        let second = session.assign(slot, inst("b", 12)).unwrap();
        assert_ne!(first, second);
        assert_eq!(session.phase(slot), Some(Phase::PreviewLoading));
        assert_eq!(
            *phases.lock().unwrap(),
            vec![(Phase::PreviewPlaying, Phase::Idle), (Phase::Idle, Phase::PreviewLoading)]
        );
        assert!(session.cache().frame(slot, first, 0).is_none());
        assert!(session.cache().diagnostic_frames(slot, first).is_empty());
        assert_eq!(session.progress(slot, Tier::Diagnostic), None);
        assert_eq!(session.progress(slot, Tier::Preview).map(|p| p.total), Some(12));

        // One token for the orphaned job, two batches for the new one
        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(slot) == Some(Phase::HandoffPending)
        }));
        assert_eq!(session.instance_key(slot), Some(second));
        assert_eq!(session.cache().diagnostic_frames(slot, second).len(), 12);
        assert!(session.cache().diagnostic_frames(slot, first).is_empty());
    }

    #[test]
    fn test_failure_stays_in_its_slot() {
        let source = Arc::new(FakeSource::new());
        let mut session =
            ViewerSession::new(ViewerConfig::default(), source.clone(), Arc::new(LoggingSurface)).unwrap();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failures);
        session.events().subscribe::<SlotFailed, _>(move |e| f.lock().unwrap().push(e.slot));
        let t0 = Instant::now();

        source.fail.store(true, Ordering::SeqCst);
        session.assign(SlotId::new(0), inst("bad", 5)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.slot_error(SlotId::new(0)).is_some()
        }));
        assert_eq!(session.slot_error(SlotId::new(0)).map(|e| e.tier), Some(Tier::Preview));
        assert_eq!(session.phase(SlotId::new(0)), Some(Phase::PreviewLoading));

        source.fail.store(false, Ordering::SeqCst);
        session.assign(SlotId::new(1), inst("good", 5)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(SlotId::new(1)) == Some(Phase::PreviewPlaying)
        }));
        assert!(session.slot_error(SlotId::new(1)).is_none());
        assert_eq!(*failures.lock().unwrap(), vec![SlotId::new(0)]);

        // Still assignable; reassignment clears the error
        session.assign(SlotId::new(0), inst("retry", 5)).unwrap();
        assert!(session.slot_error(SlotId::new(0)).is_none());
    }

    #[test]
    fn test_layout_change_flushes_slots() {
        let mut session = session(FakeSource::new().with_whole_instance(), ViewerConfig::default());
        let t0 = Instant::now();
        session.assign(SlotId::new(3), inst("x", 4)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(SlotId::new(3)) == Some(Phase::PreviewPlaying)
        }));

        // Same slot count: nothing flushed
        session.set_target_frame_rate(12);
        assert_eq!(session.phase(SlotId::new(3)), Some(Phase::PreviewPlaying));
        assert_eq!(session.frame_interval(), Duration::from_nanos(1_000_000_000 / 12));

        session.set_layout(GridLayout::Nine);
        assert_eq!(session.slot_count(), 9);
        assert_eq!(session.phase(SlotId::new(3)), Some(Phase::Idle));
        assert_eq!(session.cache().occupied_slots(), 0);
    }

    #[test]
    fn test_invalid_requests() {
        let mut session = session(FakeSource::new(), ViewerConfig { layout: GridLayout::Single, ..Default::default() });
        assert!(matches!(session.assign(SlotId::new(1), inst("x", 3)), Err(EngineError::Config(_))));
        assert!(matches!(session.assign(SlotId::new(0), inst("x", 0)), Err(EngineError::Config(_))));
        assert!(!session.pause(SlotId::new(0)));
        assert!(!session.clear(SlotId::new(0)));
        assert!(!session.seek(SlotId::new(7), 0));
        assert_eq!(session.phase(SlotId::new(5)), None);
    }

    #[test]
    fn test_pause_resume_and_preview_frame() {
        let mut session = session(FakeSource::new().with_whole_instance(), ViewerConfig::default());
        let slot = SlotId::new(0);
        let step = session.frame_interval();
        let t0 = Instant::now();
        session.assign(slot, inst("x", 6)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(slot) == Some(Phase::PreviewPlaying)
        }));

        session.tick(t0 + step);
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(1));
        assert!(session.pause(slot));
        session.tick(t0 + step * 5);
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(1));

        assert!(session.seek(slot, 4));
        let frame = session.preview_frame(slot).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 4));

        assert!(session.resume(slot));
        // First tick after resume only stamps
        session.tick(t0 + step * 6);
        session.tick(t0 + step * 7);
        assert_eq!(session.slot(slot).map(|s| s.current_frame_index), Some(5));
    }

    #[test]
    fn test_long_run_delivers_frame_events_as_they_happen() {
        let config = ViewerConfig { layout: GridLayout::Quad, target_frame_rate: 30, ..Default::default() };
        let mut session = session(FakeSource::new().with_whole_instance(), config);
        let delivered = Arc::new(Mutex::new(vec![(0usize, 0usize); 4]));
        let d = Arc::clone(&delivered);
        session.events().subscribe::<FrameAdvanced, _>(move |e| {
            let mut d = d.lock().unwrap();
            d[e.slot.index()].0 += 1;
            d[e.slot.index()].1 = e.index;
        });

        let step = session.frame_interval();
        let t0 = Instant::now();
        for i in 0..4 {
            session.assign(SlotId::new(i), inst(&format!("sop{}", i), 30)).unwrap();
        }
        assert!(wait_until(|| {
            session.tick(t0);
            session.slots().all(|s| s.phase != Phase::PreviewLoading)
        }));

        // Ten seconds of host ticks; nothing consumes events afterwards
        for k in 1..=300u32 {
            session.tick(t0 + step * k);
            let d = delivered.lock().unwrap();
            for state in session.slots() {
                assert_eq!(d[state.slot.index()].1, state.current_frame_index);
            }
        }

        let total: usize = delivered.lock().unwrap().iter().map(|(n, _)| n).sum();
        assert!(total >= 4 * 280, "only {} frame events delivered", total);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut session = session(FakeSource::new().with_whole_instance(), ViewerConfig::default());
        let t0 = Instant::now();
        session.assign(SlotId::new(0), inst("x", 3)).unwrap();
        assert!(wait_until(|| {
            session.tick(t0);
            session.phase(SlotId::new(0)) == Some(Phase::PreviewPlaying)
        }));
        let cache = Arc::clone(session.cache());
        assert!(cache.retained_bytes() > 0);

        session.shutdown();
        assert_eq!(cache.occupied_slots(), 0);
        assert_eq!(cache.retained_bytes(), 0);
        assert_eq!(session.phase(SlotId::new(0)), Some(Phase::Idle));
        assert!(session.assign(SlotId::new(0), inst("x", 3)).is_err());
        session.shutdown();
    }
}
