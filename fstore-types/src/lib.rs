//! Core type definitions for the fstore foreign storage subsystem.
//!
//! This crate owns the data model shared by every layer: chunk keys and
//! their fanout rules, chunk metadata, the chunk buffer primitive, the
//! column/schema model, the foreign table descriptor (including option
//! parsing), and the catalog trait the storage manager resolves tables
//! through.

pub mod buffer;
pub mod catalog;
pub mod chunk_key;
pub mod codec;
pub mod metadata;
pub mod schema;
pub mod table;

pub use buffer::{BufferHandle, ChunkBuffer};
pub use catalog::{ForeignTableCatalog, MemoryCatalog, RefreshTimes};
pub use chunk_key::{ChunkKey, TablePrefix};
pub use metadata::{ChunkMetadata, ChunkMetadataVec, ScalarStat};
pub use schema::{ColumnDescriptor, ColumnType, ForeignTableSchema};
pub use table::{
    CsvParseOptions, DataWrapperType, ForeignTable, RefreshInterval, RefreshParams,
    RefreshTimingType, RefreshUpdateType,
};
