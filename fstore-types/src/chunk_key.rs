//! Chunk key model.
//!
//! Every cacheable unit is addressed by an ordered tuple
//! `(db_id, table_id, column_id, fragment_id[, subkey])`. The optional 5th
//! element distinguishes the two physical buffers of a variable-length
//! column: 1 = data, 2 = index. Lexicographic ordering on the tuple drives
//! all prefix-range operations over sorted maps.

use fstore_result::{Error, Result};

pub const CHUNK_KEY_DB_IDX: usize = 0;
pub const CHUNK_KEY_TABLE_IDX: usize = 1;
pub const CHUNK_KEY_COLUMN_IDX: usize = 2;
pub const CHUNK_KEY_FRAGMENT_IDX: usize = 3;
pub const CHUNK_KEY_VARLEN_IDX: usize = 4;

/// Subkey value of the data buffer of a variable-length column.
pub const VARLEN_DATA_SUBKEY: i32 = 1;
/// Subkey value of the index buffer of a variable-length column.
pub const VARLEN_INDEX_SUBKEY: i32 = 2;

/// Ordered chunk identifier. Comparison is lexicographic, so a shorter key
/// sorts before every key it prefixes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, bitcode::Encode, bitcode::Decode)]
pub struct ChunkKey(Vec<i32>);

impl ChunkKey {
    pub fn new(parts: Vec<i32>) -> Self {
        Self(parts)
    }

    /// Two-element table key.
    pub fn table(db_id: i32, table_id: i32) -> Self {
        Self(vec![db_id, table_id])
    }

    /// Four-element key for a fixed-width column chunk.
    pub fn scalar(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        Self(vec![db_id, table_id, column_id, fragment_id])
    }

    /// Five-element key for the data buffer of a variable-length column.
    pub fn varlen_data(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        Self(vec![db_id, table_id, column_id, fragment_id, VARLEN_DATA_SUBKEY])
    }

    /// Five-element key for the index buffer of a variable-length column.
    pub fn varlen_index(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        Self(vec![db_id, table_id, column_id, fragment_id, VARLEN_INDEX_SUBKEY])
    }

    pub fn parts(&self) -> &[i32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn db_id(&self) -> i32 {
        self.0[CHUNK_KEY_DB_IDX]
    }

    pub fn table_id(&self) -> i32 {
        self.0[CHUNK_KEY_TABLE_IDX]
    }

    pub fn column_id(&self) -> i32 {
        self.0[CHUNK_KEY_COLUMN_IDX]
    }

    pub fn fragment_id(&self) -> i32 {
        self.0[CHUNK_KEY_FRAGMENT_IDX]
    }

    /// Subkey of a five-element key, if present.
    pub fn varlen_subkey(&self) -> Option<i32> {
        self.0.get(CHUNK_KEY_VARLEN_IDX).copied()
    }

    pub fn is_table_key(&self) -> bool {
        self.0.len() == 2
    }

    pub fn is_varlen_key(&self) -> bool {
        self.0.len() == 5
    }

    pub fn is_varlen_data_key(&self) -> bool {
        self.varlen_subkey() == Some(VARLEN_DATA_SUBKEY)
    }

    pub fn is_varlen_index_key(&self) -> bool {
        self.varlen_subkey() == Some(VARLEN_INDEX_SUBKEY)
    }

    /// The paired index key of a varlen data key.
    pub fn sibling_index_key(&self) -> Result<ChunkKey> {
        if !self.is_varlen_data_key() {
            return Err(Error::Internal(format!(
                "chunk key {:?} has no index sibling",
                self.0
            )));
        }
        Ok(ChunkKey::varlen_index(
            self.db_id(),
            self.table_id(),
            self.column_id(),
            self.fragment_id(),
        ))
    }

    /// The key under which this chunk's metadata lives. Metadata is kept
    /// per column and fragment, so a varlen index chunk shares its data
    /// sibling's entry.
    pub fn metadata_key(&self) -> ChunkKey {
        if self.is_varlen_index_key() {
            ChunkKey::varlen_data(self.db_id(), self.table_id(), self.column_id(), self.fragment_id())
        } else {
            self.clone()
        }
    }

    /// A well-formed chunk key has 2 to 5 elements; a 5th element must be
    /// the data or index subkey.
    pub fn validate(&self) -> Result<()> {
        if self.0.len() < 2 || self.0.len() > 5 {
            return Err(Error::Internal(format!(
                "malformed chunk key: {:?}",
                self.0
            )));
        }
        if let Some(subkey) = self.varlen_subkey()
            && subkey != VARLEN_DATA_SUBKEY
            && subkey != VARLEN_INDEX_SUBKEY
        {
            return Err(Error::Internal(format!(
                "malformed varlen subkey {subkey} in chunk key {:?}",
                self.0
            )));
        }
        Ok(())
    }

    pub fn table_prefix(&self) -> TablePrefix {
        TablePrefix {
            db_id: self.db_id(),
            table_id: self.table_id(),
        }
    }
}

/// The `(db_id, table_id)` prefix identifying one foreign table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TablePrefix {
    pub db_id: i32,
    pub table_id: i32,
}

impl TablePrefix {
    pub fn new(db_id: i32, table_id: i32) -> Self {
        Self { db_id, table_id }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::table(self.db_id, self.table_id)
    }

    /// Exclusive-ish upper bound for prefix-range scans over sorted maps:
    /// `(db, table, i32::MAX)` sorts after every real chunk key of the table
    /// (column ids never reach `i32::MAX`).
    pub fn upper_bound(&self) -> ChunkKey {
        ChunkKey::new(vec![self.db_id, self.table_id, i32::MAX])
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        key.len() >= 2 && key.db_id() == self.db_id && key.table_id() == self.table_id
    }
}
