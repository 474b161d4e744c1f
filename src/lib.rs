//! CINEGRID - dual-tier cine playback engine
//!
//! Streams multi-frame instances into a grid of playback slots: a fast
//! preview tier plays first, a full-fidelity diagnostic tier takes over at
//! the next loop boundary.

// Core engine (parser, cache, queues, scheduler, slot machines)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod paths;

// Re-export commonly used types
pub use config::{GridLayout, PreviewResolution, ViewerConfig};
pub use core::event_bus::{EventBus, SubscriptionId};
pub use core::session::ViewerSession;
pub use entities::{InstanceKey, InstanceRef, Raster, SlotId};
pub use error::{EngineError, Result};
