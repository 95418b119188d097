use std::{fmt, io};
use thiserror::Error;

/// Unified error type for all fstore operations.
///
/// The `#[error]` display strings for the source, refresh, and option
/// variants are user-visible and fixed: the SQL layer surfaces them verbatim,
/// and test fixtures assert on the exact text. Raise sites that need a
/// formatted message build it with the constructors below so the wording
/// stays in one place.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file or disk operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parquet library error while reading a columnar source.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error for wrapper state files.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The foreign table descriptor names a wrapper kind this build does not
    /// support.
    #[error("Unsupported data wrapper")]
    UnsupportedWrapper,

    /// The foreign source is malformed: column count mismatch, bad file
    /// extension, unsupported type mapping, missing statistics, oversized row
    /// group, schema mismatch across files.
    ///
    /// The message is fixed at the raise site; no cache mutation happens on
    /// this error.
    #[error("{0}")]
    SourceInvalid(String),

    /// An append refresh found a previously-scanned file smaller than before.
    #[error(
        "Refresh of foreign table created with APPEND update mode failed as file reduced in size: \"{file}\"."
    )]
    SourceShrunk { file: String },

    /// An append refresh found a previously-scanned archive entry missing.
    #[error(
        "Foreign table refreshed with APPEND mode missing archive entry \"{entry}\" from file \"{archive}\"."
    )]
    SourceMemberGone { entry: String, archive: String },

    /// Any insert, update, or delete against a foreign table.
    #[error("DELETE, INSERT, OR UPDATE commands are not supported for foreign tables.")]
    WriteRejected,

    /// The wrapper failed during chunk re-population, after the refresh
    /// already mutated the cache. The table is left metadata-warm but
    /// chunk-cold; the next refresh or on-demand fetch recovers it.
    #[error("Refresh failed after cache eviction: {0}")]
    PostEvictionRefresh(Box<Error>),

    /// Invalid value for a table or refresh option.
    #[error("{0}")]
    BadOption(String),

    /// The delimited parser could not find a line delimiter within the
    /// maximum buffer size.
    #[error("{0}")]
    ParseBufferExhausted(String),

    /// Storage key or entity not found.
    #[error("Storage key not found")]
    NotFound,

    /// Operation not supported by this component. Calling one of these is a
    /// programming error in the layer above, not a user mistake.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Internal error indicating a bug or violated invariant.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    /// Create a [`Error::SourceInvalid`] from any displayable error.
    #[inline]
    pub fn source_invalid<E: fmt::Display>(err: E) -> Self {
        Error::SourceInvalid(err.to_string())
    }

    /// Create an [`Error::Internal`] from any displayable error.
    #[inline]
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        Error::Internal(err.to_string())
    }

    /// Wrap a refresh failure that happened after the cache was mutated.
    #[inline]
    pub fn post_eviction_refresh(err: Error) -> Self {
        Error::PostEvictionRefresh(Box::new(err))
    }
}
