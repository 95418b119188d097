//! Per-column chunk encoding shared by the CSV and Parquet wrappers.
//!
//! An encoder accumulates one column's values for one fragment, producing
//! the chunk payload bytes and the running chunk metadata in a single pass.

use fstore_result::{Error, Result};
use fstore_types::codec;
use fstore_types::{ChunkMetadata, ColumnType, ScalarStat};

/// A parsed source value, neutral to the source format.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Datum>),
}

/// Encoded output of one column for one fragment.
#[derive(Debug)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    /// End-offsets buffer; present only for array columns.
    pub index: Option<Vec<u8>>,
    pub metadata: ChunkMetadata,
}

pub struct ColumnChunkEncoder {
    column_type: ColumnType,
    data: Vec<u8>,
    index: Vec<u8>,
    metadata: ChunkMetadata,
}

impl ColumnChunkEncoder {
    pub fn new(column_type: ColumnType) -> Self {
        let mut index = Vec::new();
        if column_type.is_varlen_indeed() {
            codec::put_u64(&mut index, 0);
        }
        Self {
            column_type,
            data: Vec::new(),
            index,
            metadata: ChunkMetadata::default(),
        }
    }

    pub fn push(&mut self, datum: &Datum) -> Result<()> {
        match &self.column_type {
            ColumnType::Array(elem) => {
                match datum {
                    Datum::Null => {
                        self.metadata.has_nulls = true;
                    }
                    Datum::Array(values) => {
                        for value in values {
                            encode_scalar(elem, value, &mut self.data, &mut self.metadata)?;
                        }
                    }
                    other => {
                        return Err(Error::Internal(format!(
                            "array column received non-array value {other:?}"
                        )));
                    }
                }
                codec::put_u64(&mut self.index, self.data.len() as u64);
            }
            ColumnType::Text => match datum {
                Datum::Null => {
                    codec::put_u32(&mut self.data, codec::NULL_TEXT_LEN);
                    self.metadata.has_nulls = true;
                }
                Datum::Text(value) => {
                    codec::put_u32(&mut self.data, value.len() as u32);
                    self.data.extend_from_slice(value.as_bytes());
                }
                other => {
                    return Err(Error::Internal(format!(
                        "text column received non-text value {other:?}"
                    )));
                }
            },
            scalar => encode_scalar(scalar, datum, &mut self.data, &mut self.metadata)?,
        }
        self.metadata.num_elements += 1;
        Ok(())
    }

    pub fn finish(mut self) -> EncodedChunk {
        self.metadata.num_bytes = self.data.len() as u64;
        EncodedChunk {
            data: self.data,
            index: self.column_type.is_varlen_indeed().then_some(self.index),
            metadata: self.metadata,
        }
    }
}

fn encode_scalar(
    column_type: &ColumnType,
    datum: &Datum,
    out: &mut Vec<u8>,
    metadata: &mut ChunkMetadata,
) -> Result<()> {
    match column_type {
        ColumnType::Boolean => match datum {
            Datum::Null => {
                codec::put_i8(out, codec::NULL_BOOLEAN);
                metadata.has_nulls = true;
            }
            Datum::Int(v) => {
                let v = i8::from(*v != 0);
                codec::put_i8(out, v);
                fold_int(metadata, v as i64);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::SmallInt => match datum {
            Datum::Null => {
                codec::put_i16(out, codec::NULL_SMALLINT);
                metadata.has_nulls = true;
            }
            Datum::Int(v) => {
                let v = i16::try_from(*v).map_err(|_| out_of_range(column_type, *v))?;
                codec::put_i16(out, v);
                fold_int(metadata, v as i64);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::Int => match datum {
            Datum::Null => {
                codec::put_i32(out, codec::NULL_INT);
                metadata.has_nulls = true;
            }
            Datum::Int(v) => {
                let v = i32::try_from(*v).map_err(|_| out_of_range(column_type, *v))?;
                codec::put_i32(out, v);
                fold_int(metadata, v as i64);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::BigInt | ColumnType::Timestamp => match datum {
            Datum::Null => {
                codec::put_i64(out, codec::NULL_BIGINT);
                metadata.has_nulls = true;
            }
            Datum::Int(v) => {
                codec::put_i64(out, *v);
                fold_int(metadata, *v);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::Float => match datum {
            Datum::Null => {
                codec::put_f32(out, codec::NULL_FLOAT);
                metadata.has_nulls = true;
            }
            Datum::Float(v) => {
                codec::put_f32(out, *v as f32);
                fold_float(metadata, *v);
            }
            Datum::Int(v) => {
                codec::put_f32(out, *v as f32);
                fold_float(metadata, *v as f64);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::Double => match datum {
            Datum::Null => {
                codec::put_f64(out, codec::NULL_DOUBLE);
                metadata.has_nulls = true;
            }
            Datum::Float(v) => {
                codec::put_f64(out, *v);
                fold_float(metadata, *v);
            }
            Datum::Int(v) => {
                codec::put_f64(out, *v as f64);
                fold_float(metadata, *v as f64);
            }
            other => return Err(type_mismatch(column_type, other)),
        },
        ColumnType::Text | ColumnType::Array(_) => {
            return Err(Error::Internal(format!(
                "{column_type} is not a fixed-width scalar type"
            )));
        }
    }
    Ok(())
}

fn fold_int(metadata: &mut ChunkMetadata, v: i64) {
    metadata.min.fold_min(ScalarStat::Int(v));
    metadata.max.fold_max(ScalarStat::Int(v));
}

fn fold_float(metadata: &mut ChunkMetadata, v: f64) {
    metadata.min.fold_min(ScalarStat::Float(v));
    metadata.max.fold_max(ScalarStat::Float(v));
}

fn type_mismatch(column_type: &ColumnType, datum: &Datum) -> Error {
    Error::Internal(format!("{column_type} column received mismatched value {datum:?}"))
}

fn out_of_range(column_type: &ColumnType, v: i64) -> Error {
    Error::SourceInvalid(format!("Value {v} is out of range for column type {column_type}."))
}
