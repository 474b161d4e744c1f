//! Slot and instance identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upper bound on grid slots held by a session arena.
pub const MAX_SLOTS: usize = 64;

/// Identity of a grid cell, stable for the cell's lifetime and independent
/// of which instance is assigned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl SlotId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Arena index.
    pub const fn index(self) -> usize {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 < MAX_SLOTS
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Key of one assignment of an instance to a slot.
///
/// Every assignment mints a fresh key, so reassigning the very same image
/// still invalidates cache entries and jobs keyed to the earlier assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey(Uuid);

impl InstanceKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell assignments apart in logs
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Identity of the image assigned to a slot. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub study_id: String,
    pub series_id: String,
    pub sop_instance_id: String,
    pub frame_count: usize,
    /// Frame rate recorded in the instance header, if any (informational)
    #[serde(default)]
    pub nominal_frame_rate: Option<f32>,
}

impl InstanceRef {
    pub fn new(
        study_id: impl Into<String>,
        series_id: impl Into<String>,
        sop_instance_id: impl Into<String>,
        frame_count: usize,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            series_id: series_id.into(),
            sop_instance_id: sop_instance_id.into(),
            frame_count,
            nominal_frame_rate: None,
        }
    }

    pub fn with_frame_rate(mut self, fps: f32) -> Self {
        self.nominal_frame_rate = Some(fps);
        self
    }

    /// 1-based frame numbers of the whole instance.
    pub fn frame_numbers(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.frame_count as u32
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} frames)", self.sop_instance_id, self.frame_count)
    }
}
