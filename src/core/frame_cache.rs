//! Per-slot frame cache for both tiers.
//!
//! Structure: fixed arena indexed by `SlotId`, one record per slot:
//! - preview entry: `(InstanceKey, frame_index -> Raster)`
//! - diagnostic record: `(InstanceKey, fetched frame numbers)`
//!
//! No eviction beyond explicit clear. The arena is bounded by `MAX_SLOTS`,
//! so retained memory is bounded by what the visible grid asked for.
//!
//! Every write and keyed lookup carries the `InstanceKey` of the assignment
//! it belongs to. A key mismatch is a miss (lookups) or a dropped write
//! (puts), which keeps an in-flight load for a previous image from
//! contaminating the entry of the next one.

use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::entities::{InstanceKey, MAX_SLOTS, Raster, SlotId};

/// Cache statistics for the status line and debug logs
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    dropped_puts: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped_put(&self) {
        self.dropped_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Writes discarded because their instance key was stale
    pub fn dropped_puts(&self) -> u64 {
        self.dropped_puts.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

#[derive(Debug)]
struct PreviewEntry {
    key: InstanceKey,
    frames: BTreeMap<usize, Raster>,
    expected: usize,
    complete: bool,
}

impl PreviewEntry {
    fn mem(&self) -> usize {
        self.frames.values().map(Raster::mem).sum()
    }
}

#[derive(Debug)]
struct DiagnosticRecord {
    key: InstanceKey,
    fetched: BTreeSet<u32>,
    expected: usize,
}

#[derive(Debug, Default)]
struct SlotRecord {
    preview: Option<PreviewEntry>,
    diagnostic: Option<DiagnosticRecord>,
}

/// Session-owned cache shared by the preload jobs and the session.
#[derive(Debug)]
pub struct FrameCache {
    slots: Mutex<Vec<SlotRecord>>,
    stats: CacheStats,
    retained_bytes: AtomicUsize,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SLOTS);
        slots.resize_with(MAX_SLOTS, SlotRecord::default);
        Self {
            slots: Mutex::new(slots),
            stats: CacheStats::default(),
            retained_bytes: AtomicUsize::new(0),
        }
    }

    fn with_slot<R>(&self, slot: SlotId, f: impl FnOnce(&mut SlotRecord) -> R) -> Option<R> {
        if !slot.is_valid() {
            debug!("FrameCache: {} out of range", slot);
            return None;
        }
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut slots[slot.index()]))
    }

    fn free(&self, bytes: usize) {
        // Saturating: accounting must never wrap on a double clear
        let _ = self
            .retained_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(bytes)));
    }

    // ========== Preview tier ==========

    /// Start a preview entry for a new load, discarding whatever the slot held.
    pub fn begin(&self, slot: SlotId, key: InstanceKey, expected: usize) {
        let freed = self.with_slot(slot, |rec| {
            let old = rec.preview.replace(PreviewEntry {
                key,
                frames: BTreeMap::new(),
                expected,
                complete: false,
            });
            old.map(|e| e.mem()).unwrap_or(0)
        });
        if let Some(freed) = freed {
            self.free(freed);
            trace!("FrameCache: begin {} key={} expected={}", slot, key, expected);
        }
    }

    /// Store one decoded frame (0-based index). Returns false if the key is stale.
    pub fn put(&self, slot: SlotId, key: InstanceKey, frame_index: usize, image: Raster) -> bool {
        let size = image.mem();
        let stored = self.with_slot(slot, |rec| match rec.preview.as_mut() {
            Some(entry) if entry.key == key => {
                let old = entry.frames.insert(frame_index, image);
                Some(old.map(|o| o.mem()).unwrap_or(0))
            }
            _ => None,
        });

        match stored.flatten() {
            Some(replaced) => {
                self.free(replaced);
                self.retained_bytes.fetch_add(size, Ordering::Relaxed);
                true
            }
            None => {
                self.stats.record_dropped_put();
                trace!("FrameCache: dropped stale put {} key={} frame={}", slot, key, frame_index);
                false
            }
        }
    }

    /// All decoded frames of the slot in frame order, or empty.
    pub fn get(&self, slot: SlotId) -> Vec<Raster> {
        let frames = self
            .with_slot(slot, |rec| {
                rec.preview
                    .as_ref()
                    .map(|e| e.frames.values().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        if frames.is_empty() {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        frames
    }

    /// One decoded frame for a specific assignment.
    pub fn frame(&self, slot: SlotId, key: InstanceKey, frame_index: usize) -> Option<Raster> {
        let result = self
            .with_slot(slot, |rec| {
                rec.preview
                    .as_ref()
                    .filter(|e| e.key == key)
                    .and_then(|e| e.frames.get(&frame_index).cloned())
            })
            .flatten();
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Number of decoded frames held for this assignment.
    pub fn frame_count(&self, slot: SlotId, key: InstanceKey) -> usize {
        self.with_slot(slot, |rec| {
            rec.preview.as_ref().filter(|e| e.key == key).map(|e| e.frames.len()).unwrap_or(0)
        })
        .unwrap_or(0)
    }

    /// Expected frame total recorded when the load began.
    pub fn expected(&self, slot: SlotId, key: InstanceKey) -> Option<usize> {
        self.with_slot(slot, |rec| rec.preview.as_ref().filter(|e| e.key == key).map(|e| e.expected))
            .flatten()
    }

    pub fn mark_complete(&self, slot: SlotId, key: InstanceKey) -> bool {
        self.with_slot(slot, |rec| match rec.preview.as_mut() {
            Some(entry) if entry.key == key => {
                entry.complete = true;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    pub fn is_complete(&self, slot: SlotId, key: InstanceKey) -> bool {
        self.with_slot(slot, |rec| {
            rec.preview.as_ref().is_some_and(|e| e.key == key && e.complete)
        })
        .unwrap_or(false)
    }

    // ========== Diagnostic tier ==========

    /// Start a diagnostic record for a new load.
    pub fn begin_diagnostic(&self, slot: SlotId, key: InstanceKey, expected: usize) {
        self.with_slot(slot, |rec| {
            rec.diagnostic = Some(DiagnosticRecord { key, fetched: BTreeSet::new(), expected });
        });
    }

    /// Record that the diagnostic surface received a frame. False if the key is stale.
    pub fn mark_diagnostic_fetched(&self, slot: SlotId, key: InstanceKey, frame_number: u32) -> bool {
        let ok = self
            .with_slot(slot, |rec| match rec.diagnostic.as_mut() {
                Some(record) if record.key == key => {
                    record.fetched.insert(frame_number);
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if !ok {
            self.stats.record_dropped_put();
        }
        ok
    }

    /// Fetched diagnostic frame numbers (ascending) for this assignment.
    pub fn diagnostic_frames(&self, slot: SlotId, key: InstanceKey) -> Vec<u32> {
        self.with_slot(slot, |rec| {
            rec.diagnostic
                .as_ref()
                .filter(|r| r.key == key)
                .map(|r| r.fetched.iter().copied().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// True once every expected diagnostic frame was fetched.
    pub fn diagnostic_complete(&self, slot: SlotId, key: InstanceKey) -> bool {
        self.with_slot(slot, |rec| {
            rec.diagnostic
                .as_ref()
                .is_some_and(|r| r.key == key && r.fetched.len() >= r.expected)
        })
        .unwrap_or(false)
    }

    // ========== Clearing ==========

    /// Drop both tiers' state for one slot.
    pub fn clear(&self, slot: SlotId) {
        let freed = self.with_slot(slot, |rec| {
            let freed = rec.preview.take().map(|e| e.mem()).unwrap_or(0);
            rec.diagnostic = None;
            freed
        });
        if let Some(freed) = freed {
            self.free(freed);
            if freed > 0 {
                debug!("FrameCache: cleared {} ({} KB freed)", slot, freed / 1024);
            }
        }
    }

    /// Drop every slot's state.
    pub fn clear_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for rec in slots.iter_mut() {
            rec.preview = None;
            rec.diagnostic = None;
        }
        self.retained_bytes.store(0, Ordering::Relaxed);
        debug!("FrameCache: cleared all slots");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes held by decoded preview rasters.
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes.load(Ordering::Relaxed)
    }

    /// Slots currently holding a preview entry.
    pub fn occupied_slots(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().filter(|r| r.preview.is_some()).count()
    }
}
