//! Foreign storage manager and refresh engine.
//!
//! The manager bridges two mismatched shapes: the buffer manager above it
//! demands one chunk at a time, while wrappers below it are only economical
//! when driven one fragment at a time. The bridge routes results through
//! the persistent cache (or a transient staging map when caching is off),
//! creates and recovers wrappers lazily, and exposes table lifecycle:
//! on-demand materialization, drop, manual refresh, and scheduled refresh.

pub mod manager;
pub mod refresh;
pub mod scheduler;

pub use manager::ForeignStorageMgr;
pub use refresh::parse_refresh_options;
pub use scheduler::ForeignTableRefreshScheduler;
