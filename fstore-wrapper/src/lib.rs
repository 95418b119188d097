//! Foreign data wrappers.
//!
//! A wrapper binds one foreign table to its source format. It knows how to
//! scan the entire source into chunk metadata, populate pre-allocated chunk
//! buffers one fragment at a time, and serialize/restore its own internal
//! state so a recovered cache can skip the scan.
//!
//! Concrete wrappers: [`CsvDataWrapper`], [`ParquetDataWrapper`], and the
//! [`MockForeignDataWrapper`] test double that delegates to a real wrapper.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fstore_result::Result;
use fstore_types::{BufferHandle, ChunkKey, ChunkMetadataVec, DataWrapperType, ForeignTable};

pub mod csv;
mod encoder;
mod mock;
mod parquet_wrapper;
mod source;

pub use csv::CsvDataWrapper;
pub use encoder::{ColumnChunkEncoder, Datum, EncodedChunk};
pub use mock::MockForeignDataWrapper;
pub use parquet_wrapper::ParquetDataWrapper;

/// File name of the wrapper's serialized state inside the table's cache
/// directory.
pub const WRAPPER_METADATA_FILE: &str = "wrapper_metadata.json";

/// Chunk buffers keyed by chunk key, as handed to
/// [`ForeignDataWrapper::populate_chunk_buffers`].
pub type ChunkBufferMap = BTreeMap<ChunkKey, BufferHandle>;

/// Capability set of a foreign data wrapper.
///
/// Implementations use interior locking: `populate_chunk_metadata` and
/// `populate_chunk_buffers` may be called from concurrent fetches and block
/// on the wrapper's internal state lock.
pub trait ForeignDataWrapper: Send + Sync {
    /// Scan the entire bound source, appending every chunk key with its
    /// metadata to `out`. Cost is bounded by source size.
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVec) -> Result<()>;

    /// Fill each `required` buffer; `optional` buffers may be filled as a
    /// free side effect. All keys share one `(db, table, fragment)`.
    fn populate_chunk_buffers(
        &self,
        required: &ChunkBufferMap,
        optional: &ChunkBufferMap,
    ) -> Result<()>;

    /// Write internal state needed to skip a rescan on recovery.
    fn serialize_data_wrapper_internals(&self, path: &Path) -> Result<()>;

    /// Inverse of [`serialize_data_wrapper_internals`]. Rejects a format
    /// version mismatch. `cached_metadata` is the recovered metadata of the
    /// bound table.
    ///
    /// [`serialize_data_wrapper_internals`]: Self::serialize_data_wrapper_internals
    fn restore_data_wrapper_internals(
        &self,
        path: &Path,
        cached_metadata: &ChunkMetadataVec,
    ) -> Result<()>;

    /// True iff the wrapper can populate buffers without having scanned the
    /// source in this process.
    fn is_restored(&self) -> bool;
}

/// Construct the wrapper kind named by the table descriptor.
pub fn create_data_wrapper(table: &Arc<ForeignTable>) -> Arc<dyn ForeignDataWrapper> {
    match table.wrapper_type {
        DataWrapperType::Csv => Arc::new(CsvDataWrapper::new(Arc::clone(table))),
        DataWrapperType::Parquet => Arc::new(ParquetDataWrapper::new(Arc::clone(table))),
    }
}
