//! Core engine modules - parser, cache, preload queues, scheduler, slot machines
//!
//! These modules form the playback engine, independent of any renderer.

pub mod diagnostic;
pub mod event_bus;
pub mod frame_cache;
pub mod multipart;
pub mod preload;
pub mod scheduler;
pub mod session;
pub mod slot_events;
pub mod source;
pub mod transition;
pub mod workers;

// Re-exports for convenience
pub use diagnostic::{DiagnosticQueue, DiagnosticSurface, LoggingSurface};
pub use event_bus::{EventBus, SubscriptionId};
pub use frame_cache::{CacheStats, FrameCache};
pub use multipart::{FramePart, MultipartStream, parse_multipart};
pub use preload::{PreloadPipeline, PreloadProgress, PreloadState};
pub use scheduler::AnimationScheduler;
pub use session::{SlotError, ViewerSession};
pub use source::{FrameRequest, FrameSource, HttpFrameSource};
pub use transition::{Phase, SlotMachine, SlotPlaybackState, Tier};
pub use workers::Workers;
