//! Column and schema model for foreign tables.
//!
//! A logical column is what SQL sees; physical columns are what storage
//! sees. The fanout rule maps a requested chunk key onto the full set of
//! sibling keys a wrapper materializes in one pass over the source record.

use std::fmt;

use fstore_result::{Error, Result};

use crate::chunk_key::ChunkKey;

/// Column type lattice for foreign tables.
///
/// Fixed-width scalars occupy one chunk of raw little-endian values with
/// inline null sentinels. `Text` occupies one length-prefixed chunk.
/// `Array` is the two-buffer variable-length kind: a data chunk plus an
/// index chunk of end-offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Timestamp,
    Text,
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// Byte width of one value, for fixed-width types.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::SmallInt => Some(2),
            ColumnType::Int | ColumnType::Float => Some(4),
            ColumnType::BigInt | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::Text | ColumnType::Array(_) => None,
        }
    }

    /// True for types stored as a data/index buffer pair.
    pub fn is_varlen_indeed(&self) -> bool {
        matches!(self, ColumnType::Array(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ColumnType::Array(_))
    }

    pub fn element_type(&self) -> Option<&ColumnType> {
        match self {
            ColumnType::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Extra physical columns contributed by a logical column of this type.
    /// Zero for every shipped type; multi-physical types (e.g. geometry)
    /// would return their expansion count and slot into the fanout loop
    /// unchanged.
    pub fn physical_cols(&self) -> i32 {
        0
    }

    /// An array element must be a fixed-width scalar.
    pub fn validate(&self) -> Result<()> {
        if let ColumnType::Array(elem) = self {
            if elem.fixed_width().is_none() {
                return Err(Error::SourceInvalid(format!(
                    "Unsupported array element type \"{elem}\"."
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::Int => write!(f, "INTEGER"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Timestamp => write!(f, "TIMESTAMP"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Array(elem) => write!(f, "{elem}[]"),
        }
    }
}

/// One column of a foreign table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub column_id: i32,
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    pub fn new(column_id: i32, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            column_id,
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered schema of a foreign table. Column ids are strictly increasing;
/// each entry is a logical column whose physical range is
/// `[column_id, column_id + physical_cols()]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignTableSchema {
    columns: Vec<ColumnDescriptor>,
}

impl ForeignTableSchema {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::Internal("foreign table schema has no columns".into()));
        }
        for window in columns.windows(2) {
            if window[1].column_id <= window[0].column_id {
                return Err(Error::Internal(format!(
                    "column ids must be strictly increasing: {} then {}",
                    window[0].column_id, window[1].column_id
                )));
            }
        }
        for column in &columns {
            column.column_type.validate()?;
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn num_logical_columns(&self) -> usize {
        self.columns.len()
    }

    /// Descriptor of the given physical column id.
    pub fn column_descriptor(&self, column_id: i32) -> Result<&ColumnDescriptor> {
        self.logical_column(column_id)
    }

    /// The logical column owning the given physical column id.
    pub fn logical_column(&self, column_id: i32) -> Result<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| {
                column_id >= c.column_id
                    && column_id <= c.column_id + c.column_type.physical_cols()
            })
            .ok_or_else(|| {
                Error::Internal(format!("no column with id {column_id} in foreign table schema"))
            })
    }

    /// The fanout set of a requested chunk key: every sibling key the
    /// wrapper populates while reading the source record once. The returned
    /// set always contains a key addressing the same buffer as `requested`.
    pub fn fanout_keys(&self, requested: &ChunkKey) -> Result<Vec<ChunkKey>> {
        let db_id = requested.db_id();
        let table_id = requested.table_id();
        let fragment_id = requested.fragment_id();
        let logical = self.logical_column(requested.column_id())?;

        let mut keys = Vec::new();
        for column_id in
            logical.column_id..=logical.column_id + logical.column_type.physical_cols()
        {
            let column = self.column_descriptor(column_id)?;
            if column.column_type.is_varlen_indeed() {
                keys.push(ChunkKey::varlen_data(db_id, table_id, column_id, fragment_id));
                keys.push(ChunkKey::varlen_index(db_id, table_id, column_id, fragment_id));
            } else {
                keys.push(ChunkKey::scalar(db_id, table_id, column_id, fragment_id));
            }
        }

        if !keys.contains(requested) {
            return Err(Error::Internal(format!(
                "fanout set for chunk key {:?} does not contain the requested key",
                requested.parts()
            )));
        }
        Ok(keys)
    }

    /// All chunk keys of one fragment, in column order. Used by wrappers
    /// when emitting metadata.
    pub fn fragment_keys(&self, db_id: i32, table_id: i32, fragment_id: i32) -> Vec<ChunkKey> {
        let mut keys = Vec::new();
        for column in &self.columns {
            if column.column_type.is_varlen_indeed() {
                keys.push(ChunkKey::varlen_data(db_id, table_id, column.column_id, fragment_id));
                keys.push(ChunkKey::varlen_index(db_id, table_id, column.column_id, fragment_id));
            } else {
                keys.push(ChunkKey::scalar(db_id, table_id, column.column_id, fragment_id));
            }
        }
        keys
    }
}
