//! Preview-tier preload pipeline.
//!
//! FIFO queue with at most `max_concurrent` jobs in flight (default 4,
//! clamped to 1..=16). A job turns "load frames for slot S" into fetches,
//! parser calls, decodes and cache writes, reporting `loaded/total` as it
//! goes so progress bars move before the job finishes.
//!
//! # Cancellation
//!
//! Every slot has a generation counter. Enqueue bumps it and captures the
//! new value in the job; the job compares before each effectful step (fetch,
//! cache write, callback). A superseded job may still be waiting on the
//! network, but nothing it produces lands anywhere.
//!
//! Callbacks run on worker threads while the slot's generation lock is held,
//! which is what guarantees no callback of a cancelled job fires after the
//! replacement was enqueued. Callbacks must therefore not call back into the
//! pipeline; post to a channel instead (the session does).

use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core::frame_cache::FrameCache;
use crate::core::source::{FrameRequest, FrameSource, frame_batches};
use crate::core::workers::Workers;
use crate::entities::{InstanceKey, InstanceRef, MAX_SLOTS, Raster, SlotId};
use crate::error::EngineError;

/// Default in-flight preview jobs
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
/// Hard cap on in-flight preview jobs
pub const MAX_CONCURRENT_LIMIT: usize = 16;
/// Frames per multipart request when not loading the whole instance at once
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Lifecycle of a slot's preload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PreloadState {
    Queued,
    Loading,
    Done,
    Error,
}

/// Live progress of one slot's job. Superseded, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PreloadProgress {
    pub slot: SlotId,
    pub loaded: usize,
    pub total: usize,
    pub state: PreloadState,
}

impl PreloadProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 { 0.0 } else { self.loaded as f32 / self.total as f32 }
    }
}

/// Final report of a job that was not cancelled.
#[derive(Debug)]
pub struct JobOutcome {
    pub slot: SlotId,
    pub key: InstanceKey,
    pub success: bool,
    /// Frames that made it into the cache / onto the surface
    pub loaded: usize,
    pub error: Option<EngineError>,
}

pub type ProgressFn = Arc<dyn Fn(PreloadProgress) + Send + Sync>;
pub type CompleteFn = Box<dyn FnOnce(JobOutcome) + Send>;

/// Per-slot generation counters (arena indexed by SlotId).
#[derive(Debug)]
pub(crate) struct SlotGenerations {
    counters: Mutex<Vec<u64>>,
}

impl SlotGenerations {
    pub fn new() -> Self {
        Self { counters: Mutex::new(vec![0; MAX_SLOTS]) }
    }

    /// Invalidate every job of the slot, returning the new generation.
    pub fn bump(&self, slot: SlotId) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let c = &mut counters[slot.index()];
        *c += 1;
        *c
    }

    pub fn bump_all(&self) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.iter_mut().for_each(|c| *c += 1);
    }

    pub fn is_current(&self, slot: SlotId, generation: u64) -> bool {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters[slot.index()] == generation
    }

    /// Run `f` only if `generation` is still current, holding the lock meanwhile.
    pub fn with_current<R>(&self, slot: SlotId, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        (counters[slot.index()] == generation).then(f)
    }
}

/// A queued unit of work, shared by both tiers' queues.
pub(crate) struct PreloadJob {
    pub slot: SlotId,
    pub key: InstanceKey,
    pub instance: InstanceRef,
    pub generation: u64,
    pub on_progress: ProgressFn,
    pub on_complete: CompleteFn,
}

/// Runtime knobs picked up by the next dispatched job.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Longest edge of decoded preview rasters
    pub resolution: u32,
    pub batch_size: usize,
    /// Use the source's whole-instance endpoint when it has one
    pub whole_instance: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { resolution: 256, batch_size: DEFAULT_BATCH_SIZE, whole_instance: true }
    }
}

struct QueueState {
    pending: VecDeque<PreloadJob>,
    active: usize,
    max_concurrent: usize,
    progress: Vec<Option<PreloadProgress>>,
}

struct Inner {
    state: Mutex<QueueState>,
    generations: SlotGenerations,
    settings: Mutex<PipelineSettings>,
    cache: Arc<FrameCache>,
    source: Arc<dyn FrameSource>,
    workers: Arc<Workers>,
}

/// Bounded-concurrency preview preload queue.
#[derive(Clone)]
pub struct PreloadPipeline {
    inner: Arc<Inner>,
}

impl PreloadPipeline {
    pub fn new(
        cache: Arc<FrameCache>,
        source: Arc<dyn FrameSource>,
        workers: Arc<Workers>,
        max_concurrent: usize,
    ) -> Self {
        let state = QueueState {
            pending: VecDeque::new(),
            active: 0,
            max_concurrent: max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT),
            progress: vec![None; MAX_SLOTS],
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                generations: SlotGenerations::new(),
                settings: Mutex::new(PipelineSettings::default()),
                cache,
                source,
                workers,
            }),
        }
    }

    /// Queue a load for `slot`, cancelling any job the slot already has.
    ///
    /// The cache entry for `(slot, key)` is (re)created here.
    pub fn enqueue(
        &self,
        slot: SlotId,
        key: InstanceKey,
        instance: InstanceRef,
        on_progress: ProgressFn,
        on_complete: CompleteFn,
    ) -> bool {
        if !slot.is_valid() {
            warn!("Preload: rejecting enqueue for {}", slot);
            return false;
        }

        let generation = self.inner.generations.bump(slot);
        self.inner.cache.begin(slot, key, instance.frame_count);

        let queued = PreloadProgress { slot, loaded: 0, total: instance.frame_count, state: PreloadState::Queued };
        {
            let mut state = self.inner.lock_state();
            let before = state.pending.len();
            state.pending.retain(|j| j.slot != slot);
            if state.pending.len() != before {
                debug!("Preload: dropped queued job for {}", slot);
            }
            state.progress[slot.index()] = Some(queued);
            state.pending.push_back(PreloadJob {
                slot,
                key,
                instance,
                generation,
                on_progress: Arc::clone(&on_progress),
                on_complete,
            });
        }

        self.inner.generations.with_current(slot, generation, || on_progress(queued));
        trace!("Preload: queued {} key={} gen={}", slot, key, generation);

        self.inner.pump();
        true
    }

    /// Cancel the slot's queued or active job. No callbacks of it fire afterwards.
    pub fn cancel(&self, slot: SlotId) {
        if !slot.is_valid() {
            return;
        }
        self.inner.generations.bump(slot);
        let mut state = self.inner.lock_state();
        state.pending.retain(|j| j.slot != slot);
        state.progress[slot.index()] = None;
    }

    /// Clear the queue and orphan every active job. Sockets are left to finish.
    pub fn cancel_all(&self) {
        self.inner.generations.bump_all();
        let mut state = self.inner.lock_state();
        let dropped = state.pending.len();
        state.pending.clear();
        state.progress.iter_mut().for_each(|p| *p = None);
        if dropped > 0 || state.active > 0 {
            debug!("Preload: cancel_all dropped {} queued, orphaned {} active", dropped, state.active);
        }
    }

    /// Change the concurrency bound (clamped to 1..=16); applies from the next dispatch.
    pub fn set_max_concurrent(&self, max: usize) {
        let max = max.clamp(1, MAX_CONCURRENT_LIMIT);
        {
            let mut state = self.inner.lock_state();
            if state.max_concurrent == max {
                return;
            }
            info!("Preload concurrency: {} -> {}", state.max_concurrent, max);
            state.max_concurrent = max;
        }
        self.inner.pump();
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock_state().max_concurrent
    }

    pub fn set_settings(&self, settings: PipelineSettings) {
        *self.inner.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn settings(&self) -> PipelineSettings {
        *self.inner.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current progress record of the slot, if it has a live job.
    pub fn progress(&self, slot: SlotId) -> Option<PreloadProgress> {
        if !slot.is_valid() {
            return None;
        }
        self.inner.lock_state().progress[slot.index()]
    }

    /// Jobs dispatched to workers (including orphaned ones still finishing).
    pub fn active_count(&self) -> usize {
        self.inner.lock_state().active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatch queued jobs while below the concurrency bound.
    fn pump(self: &Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock_state();
                if state.active >= state.max_concurrent {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.active += 1;
                job
            };

            // Generation lock is never taken under the state lock
            if !self.generations.is_current(job.slot, job.generation) {
                self.lock_state().active -= 1;
                continue;
            }

            let inner = Arc::clone(self);
            self.workers.execute(move || {
                inner.run(job);
                inner.lock_state().active -= 1;
                inner.pump();
            });
        }
    }

    /// Publish progress for a job that is still current.
    fn report(&self, job: &PreloadJob, progress: PreloadProgress) -> bool {
        self.generations
            .with_current(job.slot, job.generation, || {
                self.lock_state().progress[job.slot.index()] = Some(progress);
                (job.on_progress)(progress);
            })
            .is_some()
    }

    fn run(&self, job: PreloadJob) {
        let PreloadJob { slot, key, generation, .. } = job;
        let total = job.instance.frame_count;
        let settings = *self.settings.lock().unwrap_or_else(|e| e.into_inner());

        let progress = |loaded: usize, state: PreloadState| PreloadProgress {
            slot,
            loaded: loaded.min(total),
            total,
            state,
        };

        if !self.report(&job, progress(0, PreloadState::Loading)) {
            return;
        }

        let requests = if settings.whole_instance && self.source.supports_whole_instance() {
            vec![FrameRequest::WholeInstance { resolution: settings.resolution }]
        } else {
            frame_batches(&job.instance, settings.batch_size)
        };

        let mut loaded = 0usize;
        let mut decoded = 0usize;
        let mut requested = 0usize;

        for request in &requests {
            if !self.generations.is_current(slot, generation) {
                trace!("Preload: {} gen={} cancelled before fetch", slot, generation);
                return;
            }

            let parts = match self.source.fetch(&job.instance, request) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Preload: {} fetch failed: {}", slot, e);
                    self.complete(job, false, decoded, Some(e), progress(loaded, PreloadState::Error));
                    return;
                }
            };
            requested += request.expected(&job.instance);

            for part in parts {
                if !self.generations.is_current(slot, generation) {
                    return;
                }
                match Raster::decode(part.frame_number, &part.bytes, Some(settings.resolution)) {
                    Ok(raster) => {
                        let index = part.frame_number.saturating_sub(1) as usize;
                        if self.cache.put(slot, key, index, raster) {
                            decoded += 1;
                        }
                    }
                    // Missing frame is simply absent from the cache
                    Err(e) => debug!("Preload: {} {}", slot, e),
                }
                loaded += 1;
                self.report(&job, progress(loaded, PreloadState::Loading));
            }

            // Frames the server left out still count, so progress can't stall
            if loaded < requested {
                loaded = requested;
                self.report(&job, progress(loaded, PreloadState::Loading));
            }
        }

        if decoded == 0 {
            let err = EngineError::Empty(job.instance.sop_instance_id.clone());
            warn!("Preload: {} decoded nothing for {}", slot, job.instance);
            self.complete(job, false, 0, Some(err), progress(loaded, PreloadState::Error));
            return;
        }

        self.cache.mark_complete(slot, key);
        debug!("Preload: {} done, {}/{} frames decoded", slot, decoded, total);
        self.complete(job, true, decoded, None, progress(total, PreloadState::Done));
    }

    fn complete(
        &self,
        job: PreloadJob,
        success: bool,
        loaded: usize,
        error: Option<EngineError>,
        last: PreloadProgress,
    ) {
        let PreloadJob { slot, key, generation, on_progress, on_complete, .. } = job;
        self.generations.with_current(slot, generation, || {
            self.lock_state().progress[slot.index()] = Some(last);
            on_progress(last);
            on_complete(JobOutcome { slot, key, success, loaded, error });
        });
    }
}
