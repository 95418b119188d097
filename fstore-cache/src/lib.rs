//! Persistent foreign storage cache.
//!
//! The cache is a table-partitioned store of chunk buffers and chunk
//! metadata backed by one directory per table under a single base path.
//! It hands out empty buffers for wrappers to fill, promotes them to
//! durable on request, recovers state from disk after a restart, and
//! answers metadata-only queries without ever touching a wrapper.
//!
//! # On-disk layout
//!
//! ```text
//! <base>/<db_id>_<table_id>/
//!   chunks/<col>_<frag>[_<subkey>]   -- raw chunk bytes
//!   metadata.log                     -- length-prefixed bitcode frames
//!   wrapper_metadata.json            -- written by the wrapper's serialize
//! ```
//!
//! # Invariant
//!
//! If a chunk buffer is present, the metadata for that chunk is present.
//! The reverse does not hold: metadata-only entries are normal and are how
//! `COUNT(*)`-style queries run without materializing anything.

mod cache;
mod disk;

pub use cache::ForeignStorageCache;
