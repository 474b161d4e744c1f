//! Diagnostic-tier preload queue.
//!
//! At most one job runs at a time so full-fidelity fetches never starve the
//! preview tier's network and decode budget. Waiting jobs are kept per slot
//! and the next job is always the lowest waiting SlotId, regardless of
//! arrival order.
//!
//! Parts are not decoded here. They go to the [`DiagnosticSurface`], an
//! opaque full-fidelity renderer, and only the fetched frame numbers are
//! recorded in the cache.

use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::frame_cache::FrameCache;
use crate::core::multipart::FramePart;
use crate::core::preload::{
    CompleteFn, JobOutcome, PreloadJob, PreloadProgress, PreloadState, ProgressFn, SlotGenerations,
};
use crate::core::source::{FrameSource, frame_batches};
use crate::core::workers::Workers;
use crate::entities::{InstanceKey, InstanceRef, MAX_SLOTS, SlotId};
use crate::error::{EngineError, Result};

/// Full-fidelity renderer fed with raw frame payloads.
///
/// Called from worker threads.
pub trait DiagnosticSurface: Send + Sync {
    /// Hand one frame of the slot's current assignment to the renderer.
    fn load_frame(&self, slot: SlotId, key: InstanceKey, part: &FramePart) -> Result<()>;

    /// Drop everything held for the slot.
    fn release(&self, _slot: SlotId) {}
}

/// Surface that accepts every frame and only logs it. Used headless.
#[derive(Debug, Default)]
pub struct LoggingSurface;

impl DiagnosticSurface for LoggingSurface {
    fn load_frame(&self, slot: SlotId, key: InstanceKey, part: &FramePart) -> Result<()> {
        trace!(
            "Diagnostic surface: {} key={} frame={} ({} bytes, {})",
            slot,
            key,
            part.frame_number,
            part.bytes.len(),
            part.codec_id.as_deref().unwrap_or(&part.content_type)
        );
        Ok(())
    }

    fn release(&self, slot: SlotId) {
        trace!("Diagnostic surface: release {}", slot);
    }
}

struct QueueState {
    pending: BTreeMap<SlotId, PreloadJob>,
    active: Option<SlotId>,
    progress: Vec<Option<PreloadProgress>>,
}

struct Inner {
    state: Mutex<QueueState>,
    generations: SlotGenerations,
    batch_size: Mutex<usize>,
    cache: Arc<FrameCache>,
    source: Arc<dyn FrameSource>,
    surface: Arc<dyn DiagnosticSurface>,
    workers: Arc<Workers>,
}

/// Single-concurrency diagnostic preload queue.
#[derive(Clone)]
pub struct DiagnosticQueue {
    inner: Arc<Inner>,
}

impl DiagnosticQueue {
    pub fn new(
        cache: Arc<FrameCache>,
        source: Arc<dyn FrameSource>,
        surface: Arc<dyn DiagnosticSurface>,
        workers: Arc<Workers>,
        batch_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    active: None,
                    progress: vec![None; MAX_SLOTS],
                }),
                generations: SlotGenerations::new(),
                batch_size: Mutex::new(batch_size.max(1)),
                cache,
                source,
                surface,
                workers,
            }),
        }
    }

    /// Queue a full-fidelity load, replacing whatever the slot had queued or running.
    pub fn enqueue(
        &self,
        slot: SlotId,
        key: InstanceKey,
        instance: InstanceRef,
        on_progress: ProgressFn,
        on_complete: CompleteFn,
    ) -> bool {
        if !slot.is_valid() {
            warn!("Diagnostic: rejecting enqueue for {}", slot);
            return false;
        }

        let generation = self.inner.generations.bump(slot);
        self.inner.cache.begin_diagnostic(slot, key, instance.frame_count);

        let queued = PreloadProgress { slot, loaded: 0, total: instance.frame_count, state: PreloadState::Queued };
        {
            let mut state = self.inner.lock_state();
            state.progress[slot.index()] = Some(queued);
            let job = PreloadJob {
                slot,
                key,
                instance,
                generation,
                on_progress: Arc::clone(&on_progress),
                on_complete,
            };
            if state.pending.insert(slot, job).is_some() {
                debug!("Diagnostic: replaced queued job for {}", slot);
            }
        }

        self.inner.generations.with_current(slot, generation, || on_progress(queued));
        trace!("Diagnostic: queued {} key={} gen={}", slot, key, generation);

        self.inner.pump();
        true
    }

    pub fn cancel(&self, slot: SlotId) {
        if !slot.is_valid() {
            return;
        }
        self.inner.generations.bump(slot);
        let mut state = self.inner.lock_state();
        state.pending.remove(&slot);
        state.progress[slot.index()] = None;
    }

    pub fn cancel_all(&self) {
        self.inner.generations.bump_all();
        let mut state = self.inner.lock_state();
        state.pending.clear();
        state.progress.iter_mut().for_each(|p| *p = None);
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        *self.inner.batch_size.lock().unwrap_or_else(|e| e.into_inner()) = batch_size.max(1);
    }

    pub fn progress(&self, slot: SlotId) -> Option<PreloadProgress> {
        if !slot.is_valid() {
            return None;
        }
        self.inner.lock_state().progress[slot.index()]
    }

    /// Slot whose job occupies the single worker right now.
    pub fn active_slot(&self) -> Option<SlotId> {
        self.inner.lock_state().active
    }

    pub fn queued_slots(&self) -> Vec<SlotId> {
        self.inner.lock_state().pending.keys().copied().collect()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pump(self: &Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock_state();
                if state.active.is_some() {
                    return;
                }
                let Some((slot, job)) = state.pending.pop_first() else {
                    return;
                };
                state.active = Some(slot);
                job
            };

            if !self.generations.is_current(job.slot, job.generation) {
                self.lock_state().active = None;
                continue;
            }

            info!("Diagnostic: start {} ({})", job.slot, job.instance);
            let inner = Arc::clone(self);
            self.workers.execute(move || {
                inner.run(job);
                inner.lock_state().active = None;
                inner.pump();
            });
        }
    }

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
        let batch_size = *self.batch_size.lock().unwrap_or_else(|e| e.into_inner());
        let progress = |loaded: usize, state: PreloadState| PreloadProgress {
            slot,
            loaded: loaded.min(total),
            total,
            state,
        };

        if !self.report(&job, progress(0, PreloadState::Loading)) {
            return;
        }

        let mut loaded = 0usize;
        let mut fetched = 0usize;
        for request in frame_batches(&job.instance, batch_size) {
            if !self.generations.is_current(slot, generation) {
                debug!("Diagnostic: {} instance changed, dropping job", slot);
                return;
            }

            let parts = match self.source.fetch(&job.instance, &request) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Diagnostic: {} fetch failed: {}", slot, e);
                    self.complete(job, false, fetched, Some(e), progress(loaded, PreloadState::Error));
                    return;
                }
            };
            let requested = loaded + request.expected(&job.instance);

            for part in parts {
                if !self.generations.is_current(slot, generation) {
                    return;
                }
                match self.surface.load_frame(slot, key, &part) {
                    Ok(()) => {
                        if self.cache.mark_diagnostic_fetched(slot, key, part.frame_number) {
                            fetched += 1;
                        }
                    }
                    Err(e) => debug!("Diagnostic: {} frame {} rejected: {}", slot, part.frame_number, e),
                }
                loaded += 1;
                self.report(&job, progress(loaded, PreloadState::Loading));
            }

            if loaded < requested {
                loaded = requested;
                self.report(&job, progress(loaded, PreloadState::Loading));
            }
        }

        if fetched == 0 {
            let err = EngineError::Empty(job.instance.sop_instance_id.clone());
            self.complete(job, false, 0, Some(err), progress(loaded, PreloadState::Error));
            return;
        }

        info!("Diagnostic: {} done, {}/{} frames", slot, fetched, total);
        self.complete(job, true, fetched, None, progress(total, PreloadState::Done));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::preload::test_util::*;
    use crate::core::source::fake::FakeSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Surface that counts frames and rejects a chosen frame number.
    #[derive(Default)]
    struct CountingSurface {
        frames: AtomicUsize,
        reject: Option<u32>,
    }

    impl DiagnosticSurface for CountingSurface {
        fn load_frame(&self, _slot: SlotId, _key: InstanceKey, part: &FramePart) -> Result<()> {
            if self.reject == Some(part.frame_number) {
                return Err(EngineError::Decode { frame: part.frame_number, reason: "unsupported".into() });
            }
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type Done = Arc<Mutex<Vec<(SlotId, InstanceKey, bool)>>>;

    fn queue(source: FakeSource, surface: Arc<dyn DiagnosticSurface>) -> (DiagnosticQueue, Arc<FrameCache>) {
        let cache = Arc::new(FrameCache::new());
        let workers = Arc::new(Workers::new(4, "diag-test").unwrap());
        let queue = DiagnosticQueue::new(Arc::clone(&cache), Arc::new(source), surface, workers, 4);
        (queue, cache)
    }

    fn on_done(done: &Done) -> CompleteFn {
        let done = Arc::clone(done);
        Box::new(move |o: JobOutcome| done.lock().unwrap().push((o.slot, o.key, o.success)))
    }

    fn inst(frames: usize) -> InstanceRef {
        InstanceRef::new("st", "se", "sop", frames)
    }

    #[test]
    fn test_records_fetched_frames() {
        let surface = Arc::new(CountingSurface::default());
        let (queue, cache) = queue(FakeSource::new(), surface.clone());
        let done: Done = Default::default();
        let (slot, key) = (SlotId::new(2), InstanceKey::new());

        queue.enqueue(slot, key, inst(10), noop_progress(), on_done(&done));

        assert!(wait_until(|| done.lock().unwrap().len() == 1));
        assert_eq!(done.lock().unwrap()[0], (slot, key, true));
        assert_eq!(surface.frames.load(Ordering::SeqCst), 10);
        assert_eq!(cache.diagnostic_frames(slot, key), (1..=10).collect::<Vec<u32>>());
        assert!(cache.diagnostic_complete(slot, key));
        assert_eq!(queue.progress(slot).map(|p| p.state), Some(PreloadState::Done));
    }

    #[test]
    fn test_single_active_lowest_slot_next() {
        let (source, gate) = FakeSource::gated();
        let (queue, _cache) = queue(source, Arc::new(LoggingSurface));
        let done: Done = Default::default();

        for i in [3, 0, 2] {
            queue.enqueue(SlotId::new(i), InstanceKey::new(), inst(1), noop_progress(), on_done(&done));
        }
        // First arrival took the worker, the rest wait
        assert_eq!(queue.active_slot(), Some(SlotId::new(3)));
        assert_eq!(queue.queued_slots(), vec![SlotId::new(0), SlotId::new(2)]);

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| done.lock().unwrap().len() == 3));
        let order: Vec<usize> = done.lock().unwrap().iter().map(|d| d.0.index()).collect();
        assert_eq!(order, vec![3, 0, 2]);
    }

    #[test]
    fn test_instance_change_cancels_active_job() {
        let (source, gate) = FakeSource::gated();
        let (queue, cache) = queue(source, Arc::new(LoggingSurface));
        let done: Done = Default::default();
        let slot = SlotId::new(1);
        let (old_key, new_key) = (InstanceKey::new(), InstanceKey::new());

        queue.enqueue(slot, old_key, inst(2), noop_progress(), on_done(&done));
        assert!(wait_until(|| queue.progress(slot).map(|p| p.state) == Some(PreloadState::Loading)));
        queue.enqueue(slot, new_key, inst(2), noop_progress(), on_done(&done));

        for _ in 0..2 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| !done.lock().unwrap().is_empty()));
        assert!(wait_until(|| queue.active_slot().is_none()));

        assert_eq!(*done.lock().unwrap(), vec![(slot, new_key, true)]);
        assert!(cache.diagnostic_frames(slot, old_key).is_empty());
        assert_eq!(cache.diagnostic_frames(slot, new_key), vec![1, 2]);
    }

    #[test]
    fn test_rejected_frames_still_complete() {
        let surface = Arc::new(CountingSurface { reject: Some(2), ..Default::default() });
        let (queue, cache) = queue(FakeSource::new(), surface);
        let done: Done = Default::default();
        let (slot, key) = (SlotId::new(0), InstanceKey::new());

        queue.enqueue(slot, key, inst(3), noop_progress(), on_done(&done));

        assert!(wait_until(|| done.lock().unwrap().len() == 1));
        assert!(done.lock().unwrap()[0].2);
        assert_eq!(cache.diagnostic_frames(slot, key), vec![1, 3]);
        assert_eq!(queue.progress(slot).map(|p| p.loaded), Some(3));
    }

    #[test]
    fn test_transport_failure_reported() {
        let source = FakeSource::new();
        source.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let (queue, _cache) = queue(source, Arc::new(LoggingSurface));
        let done: Done = Default::default();

        queue.enqueue(SlotId::new(0), InstanceKey::new(), inst(3), noop_progress(), on_done(&done));
        assert!(wait_until(|| done.lock().unwrap().len() == 1));
        assert!(!done.lock().unwrap()[0].2);
        // Worker is free again for other slots
        assert!(wait_until(|| queue.active_slot().is_none()));
    }
}
