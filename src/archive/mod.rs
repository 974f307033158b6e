//! Persistent layered archives and per-session views over them.

pub mod layered;
pub mod layout;
pub mod mapping;

pub use layered::{AggregateOutcome, CompactionLock, LayeredArchive};
pub use layout::{Area, ArchiveLayout, Level};
pub use mapping::SessionMapping;
