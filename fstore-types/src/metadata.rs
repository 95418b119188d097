//! Per-chunk metadata: element count, byte size, compact min/max, null flag.

use crate::chunk_key::ChunkKey;

/// Compact numeric statistic carried in chunk metadata. Non-numeric columns
/// leave min/max absent.
#[derive(Debug, Clone, Copy, PartialEq, Default, bitcode::Encode, bitcode::Decode)]
pub enum ScalarStat {
    #[default]
    Absent,
    Int(i64),
    Float(f64),
}

impl ScalarStat {
    pub fn is_absent(&self) -> bool {
        matches!(self, ScalarStat::Absent)
    }

    /// Fold another observed value into a running minimum.
    pub fn fold_min(&mut self, other: ScalarStat) {
        *self = match (*self, other) {
            (ScalarStat::Absent, v) => v,
            (v, ScalarStat::Absent) => v,
            (ScalarStat::Int(a), ScalarStat::Int(b)) => ScalarStat::Int(a.min(b)),
            (ScalarStat::Float(a), ScalarStat::Float(b)) => ScalarStat::Float(a.min(b)),
            (a, _) => a,
        };
    }

    /// Fold another observed value into a running maximum.
    pub fn fold_max(&mut self, other: ScalarStat) {
        *self = match (*self, other) {
            (ScalarStat::Absent, v) => v,
            (v, ScalarStat::Absent) => v,
            (ScalarStat::Int(a), ScalarStat::Int(b)) => ScalarStat::Int(a.max(b)),
            (ScalarStat::Float(a), ScalarStat::Float(b)) => ScalarStat::Float(a.max(b)),
            (a, _) => a,
        };
    }
}

/// Metadata for a single chunk. Durable before any chunk bytes of the same
/// fragment are considered durable.
#[derive(Debug, Clone, Copy, PartialEq, Default, bitcode::Encode, bitcode::Decode)]
pub struct ChunkMetadata {
    pub num_elements: u64,
    pub num_bytes: u64,
    pub min: ScalarStat,
    pub max: ScalarStat,
    pub has_nulls: bool,
}

/// Ordered collection of `(key, metadata)` pairs, the currency of the
/// wrapper metadata-scan protocol.
pub type ChunkMetadataVec = Vec<(ChunkKey, ChunkMetadata)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_folding() {
        let mut min = ScalarStat::Absent;
        let mut max = ScalarStat::Absent;
        for v in [3i64, -1, 7] {
            min.fold_min(ScalarStat::Int(v));
            max.fold_max(ScalarStat::Int(v));
        }
        assert_eq!(min, ScalarStat::Int(-1));
        assert_eq!(max, ScalarStat::Int(7));
    }
}
