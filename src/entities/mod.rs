//! Entities - plain data shared by every engine component
//!
//! Slot and instance identity, plus the decoded raster type stored in the
//! preview cache.

pub mod instance;
pub mod raster;

pub use instance::{InstanceKey, InstanceRef, MAX_SLOTS, SlotId};
pub use raster::Raster;
