//! Parquet data wrapper.
//!
//! Chunk metadata comes straight from row-group statistics in the file
//! footers, so a metadata scan never touches data pages. Row groups pack
//! into fragments in file order; a row group larger than the fragment size
//! is rejected. Buffer population reads the fragment's row groups through
//! the Arrow record batch reader and re-encodes them into chunk payloads.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray, TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit as ArrowTimeUnit};
use fstore_result::{Error, Result};
use fstore_types::{
    ChunkKey, ChunkMetadata, ChunkMetadataVec, ColumnDescriptor, ColumnType, ForeignTable,
    ScalarStat,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{LogicalType, TimeUnit, Type as PhysicalType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::statistics::Statistics;
use serde::{Deserialize, Serialize};

use crate::encoder::{ColumnChunkEncoder, Datum};
use crate::{ChunkBufferMap, ForeignDataWrapper};

const PARQUET_WRAPPER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ParquetFileState {
    path: String,
    size: u64,
    row_group_rows: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RowGroupRef {
    file: usize,
    row_group: usize,
    rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ParquetFragmentSpan {
    fragment_id: i32,
    row_count: u64,
    pieces: Vec<RowGroupRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ParquetWrapperSnapshot {
    version: u32,
    files: Vec<ParquetFileState>,
    fragments: Vec<ParquetFragmentSpan>,
}

#[derive(Debug, Clone)]
struct WrapperState {
    snapshot: ParquetWrapperSnapshot,
    chunk_metadata: ChunkMetadataVec,
}

pub struct ParquetDataWrapper {
    table: Arc<ForeignTable>,
    state: Mutex<Option<WrapperState>>,
    restored: AtomicBool,
}

impl ParquetDataWrapper {
    pub fn new(table: Arc<ForeignTable>) -> Self {
        Self {
            table,
            state: Mutex::new(None),
            restored: AtomicBool::new(false),
        }
    }

    fn scan(&self, files: Vec<PathBuf>) -> Result<WrapperState> {
        let table = &self.table;
        let columns = table.schema.columns();
        let fragment_size = table.fragment_size as u64;

        let mut file_states = Vec::with_capacity(files.len());
        let mut reference: Option<(String, Vec<String>)> = None;
        let mut fragments: Vec<(ParquetFragmentSpan, Vec<ChunkMetadata>)> = Vec::new();
        let mut current: Option<(ParquetFragmentSpan, Vec<ChunkMetadata>)> = None;
        let mut next_fragment_id = 0;

        for (file_idx, path) in files.iter().enumerate() {
            let reader = SerializedFileReader::new(File::open(path)?)?;
            let metadata = reader.metadata();
            validate_file_schema(table, path, metadata.file_metadata().schema_descr(), &mut reference)?;

            let mut row_group_rows = Vec::with_capacity(metadata.num_row_groups());
            for rg_idx in 0..metadata.num_row_groups() {
                let row_group = metadata.row_group(rg_idx);
                let rows = row_group.num_rows() as u64;
                row_group_rows.push(rows);
                if rows > fragment_size {
                    return Err(Error::SourceInvalid(format!(
                        "Parquet file has a row group size that is larger than the fragment size. \
                         Please set the table fragment size to a number that is larger than the \
                         row group size. Row group index: {rg_idx}, row group size: {rows}, \
                         fragment size: {fragment_size}, file path: {}",
                        path.display()
                    )));
                }

                let needs_new = match &current {
                    Some((span, _)) => span.row_count + rows > fragment_size,
                    None => true,
                };
                if needs_new {
                    if let Some(done) = current.take() {
                        fragments.push(done);
                    }
                    current = Some((
                        ParquetFragmentSpan {
                            fragment_id: next_fragment_id,
                            row_count: 0,
                            pieces: Vec::new(),
                        },
                        vec![ChunkMetadata::default(); columns.len()],
                    ));
                    next_fragment_id += 1;
                }
                let (span, column_meta) = current.as_mut().unwrap();
                span.row_count += rows;
                span.pieces.push(RowGroupRef {
                    file: file_idx,
                    row_group: rg_idx,
                    rows,
                });
                for (col_idx, column) in columns.iter().enumerate() {
                    let chunk = row_group.column(col_idx);
                    let stats = chunk.statistics().ok_or_else(|| {
                        Error::SourceInvalid(format!(
                            "Statistics metadata is required for all row groups. Metadata is \
                             missing for row group index: {rg_idx}, column index: {col_idx}, \
                             file path: {}",
                            path.display()
                        ))
                    })?;
                    let divisor = match column.column_type {
                        ColumnType::Timestamp => timestamp_divisor(
                            metadata
                                .file_metadata()
                                .schema_descr()
                                .column(col_idx)
                                .logical_type()
                                .as_ref(),
                        ),
                        _ => 1,
                    };
                    fold_statistics(&mut column_meta[col_idx], column, stats, rows, divisor)?;
                }
            }
            file_states.push(ParquetFileState {
                path: path.to_string_lossy().into_owned(),
                size: std::fs::metadata(path)?.len(),
                row_group_rows,
            });
        }
        if let Some(done) = current.take() {
            fragments.push(done);
        }

        let mut chunk_metadata = ChunkMetadataVec::new();
        let mut spans = Vec::with_capacity(fragments.len());
        for (span, column_meta) in fragments {
            for (column, meta) in columns.iter().zip(column_meta) {
                chunk_metadata.push((
                    ChunkKey::scalar(table.db_id, table.table_id, column.column_id, span.fragment_id),
                    meta,
                ));
            }
            spans.push(span);
        }
        Ok(WrapperState {
            snapshot: ParquetWrapperSnapshot {
                version: PARQUET_WRAPPER_VERSION,
                files: file_states,
                fragments: spans,
            },
            chunk_metadata,
        })
    }

    /// The append contract: known files may gain row groups but never lose
    /// rows; new files append after the known ones in their original order.
    fn append_file_order(&self, prior: &ParquetWrapperSnapshot) -> Result<Vec<PathBuf>> {
        let fresh = enumerate_parquet_files(&self.table.file_path)?;
        let mut ordered = Vec::with_capacity(fresh.len());
        for known in &prior.files {
            let path = PathBuf::from(&known.path);
            if !fresh.contains(&path) {
                return Err(Error::SourceShrunk {
                    file: crate::source::file_name(&path),
                });
            }
            let reader = SerializedFileReader::new(File::open(&path)?)?;
            let metadata = reader.metadata();
            if metadata.num_row_groups() < known.row_group_rows.len() {
                return Err(Error::SourceShrunk {
                    file: crate::source::file_name(&path),
                });
            }
            for (rg_idx, prior_rows) in known.row_group_rows.iter().enumerate() {
                if metadata.row_group(rg_idx).num_rows() as u64 != *prior_rows {
                    return Err(Error::SourceShrunk {
                        file: crate::source::file_name(&path),
                    });
                }
            }
            ordered.push(path);
        }
        for path in fresh {
            if !ordered.contains(&path) {
                ordered.push(path);
            }
        }
        Ok(ordered)
    }
}

impl ForeignDataWrapper for ParquetDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVec) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let files = match guard.as_ref() {
            Some(prior) if self.table.is_append_mode() => {
                self.append_file_order(&prior.snapshot)?
            }
            _ => enumerate_parquet_files(&self.table.file_path)?,
        };
        let new_state = self.scan(files)?;
        out.extend(new_state.chunk_metadata.iter().cloned());
        *guard = Some(new_state);
        Ok(())
    }

    fn populate_chunk_buffers(
        &self,
        required: &ChunkBufferMap,
        optional: &ChunkBufferMap,
    ) -> Result<()> {
        let first = required.keys().next().ok_or_else(|| {
            Error::Internal("populate_chunk_buffers called with no required buffers".into())
        })?;
        let fragment_id = first.fragment_id();
        for key in required.keys().chain(optional.keys()) {
            if key.table_prefix() != self.table.table_prefix() || key.fragment_id() != fragment_id {
                return Err(Error::Internal(format!(
                    "chunk key {:?} is outside the populated fragment",
                    key.parts()
                )));
            }
        }

        let guard = self.state.lock().unwrap();
        let state = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("data wrapper has not scanned its source".into()))?;
        let fragment = state
            .snapshot
            .fragments
            .iter()
            .find(|f| f.fragment_id == fragment_id)
            .ok_or(Error::NotFound)?;

        let columns = self.table.schema.columns();
        let mut encoders: Vec<ColumnChunkEncoder> = columns
            .iter()
            .map(|c| ColumnChunkEncoder::new(c.column_type.clone()))
            .collect();
        for piece in &fragment.pieces {
            let path = &state.snapshot.files[piece.file].path;
            let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
            let reader = builder.with_row_groups(vec![piece.row_group]).build()?;
            for batch in reader {
                let batch = batch.map_err(|err| Error::SourceInvalid(err.to_string()))?;
                for row in 0..batch.num_rows() {
                    for (col_idx, encoder) in encoders.iter_mut().enumerate() {
                        let datum = array_datum(batch.column(col_idx), row)?;
                        encoder.push(&datum)?;
                    }
                }
            }
        }

        let mut delivered = 0usize;
        for (column, encoder) in columns.iter().zip(encoders) {
            let chunk = encoder.finish();
            let key = ChunkKey::scalar(
                self.table.db_id,
                self.table.table_id,
                column.column_id,
                fragment_id,
            );
            if let Some(buffer) = required.get(&key) {
                buffer.write(&chunk.data);
                delivered += 1;
            } else if let Some(buffer) = optional.get(&key) {
                buffer.write(&chunk.data);
            }
        }
        if delivered != required.len() {
            return Err(Error::Internal(format!(
                "populated {delivered} of {} required chunk buffers for fragment {fragment_id}",
                required.len()
            )));
        }
        Ok(())
    }

    fn serialize_data_wrapper_internals(&self, path: &Path) -> Result<()> {
        let guard = self.state.lock().unwrap();
        let state = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("serializing an unscanned data wrapper".into()))?;
        let json = serde_json::to_vec_pretty(&state.snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn restore_data_wrapper_internals(
        &self,
        path: &Path,
        cached_metadata: &ChunkMetadataVec,
    ) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let snapshot: ParquetWrapperSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != PARQUET_WRAPPER_VERSION {
            return Err(Error::Internal(format!(
                "unsupported wrapper metadata version {} (expected {PARQUET_WRAPPER_VERSION})",
                snapshot.version
            )));
        }
        let mut guard = self.state.lock().unwrap();
        *guard = Some(WrapperState {
            snapshot,
            chunk_metadata: cached_metadata.clone(),
        });
        self.restored.store(true, Ordering::Release);
        Ok(())
    }

    fn is_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }
}

fn enumerate_parquet_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::SourceInvalid(format!(
            "File or directory \"{}\" does not exist.",
            root.display()
        )));
    }
    if !root.is_dir() {
        check_parquet_extension(root)?;
        return Ok(vec![root.to_path_buf()]);
    }
    let mut files = Vec::new();
    collect_parquet_files(root, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_parquet_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = crate::source::file_name(&path);
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_parquet_files(&path, out)?;
        } else {
            check_parquet_extension(&path)?;
            out.push(path);
        }
    }
    Ok(())
}

fn check_parquet_extension(path: &Path) -> Result<()> {
    let ok = path
        .extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case("parquet"));
    if ok {
        Ok(())
    } else {
        Err(Error::SourceInvalid(format!(
            "Invalid extention for file \"{}\".",
            path.display()
        )))
    }
}

/// Check one file's schema against the table schema and against the first
/// file seen (the reference).
fn validate_file_schema(
    table: &ForeignTable,
    path: &Path,
    schema: &parquet::schema::types::SchemaDescriptor,
    reference: &mut Option<(String, Vec<String>)>,
) -> Result<()> {
    let columns = table.schema.columns();
    let column_names: Vec<String> =
        (0..schema.num_columns()).map(|i| schema.column(i).name().to_string()).collect();

    if let Some((ref_path, ref_names)) = reference {
        if ref_names.len() != column_names.len() {
            return Err(Error::SourceInvalid(format!(
                "Parquet file \"{}\" has a different schema. Please ensure that all Parquet \
                 files use the same schema. Reference Parquet file: \"{ref_path}\" has {} \
                 columns. New Parquet file \"{}\" has {} columns.",
                path.display(),
                ref_names.len(),
                path.display(),
                column_names.len()
            )));
        }
        for (ref_name, new_name) in ref_names.iter().zip(&column_names) {
            if ref_name != new_name {
                return Err(Error::SourceInvalid(format!(
                    "Parquet file \"{}\" has a different schema. Please ensure that all \
                     Parquet files use the same schema. Reference Parquet file: {ref_path}, \
                     column name: {ref_name}. New Parquet file: {}, column name: {new_name}.",
                    path.display(),
                    path.display()
                )));
            }
        }
    } else {
        *reference = Some((path.to_string_lossy().into_owned(), column_names.clone()));
    }

    if schema.num_columns() != columns.len() {
        return Err(Error::SourceInvalid(format!(
            "Mismatched number of logical columns: (expected {} columns, has {}): in file '{}'",
            columns.len(),
            schema.num_columns(),
            path.display()
        )));
    }
    for (col_idx, column) in columns.iter().enumerate() {
        let descr = schema.column(col_idx);
        check_column_mapping(column, descr.physical_type(), descr.logical_type().as_ref(), descr.name())?;
    }
    Ok(())
}

fn check_column_mapping(
    column: &ColumnDescriptor,
    physical: PhysicalType,
    logical: Option<&LogicalType>,
    name: &str,
) -> Result<()> {
    let mismatch = || {
        Error::SourceInvalid(format!(
            "Conversion from Parquet type \"{physical}\" to column type \"{}\" is not allowed. \
             Please use an appropriate column type.",
            column.column_type
        ))
    };
    match &column.column_type {
        ColumnType::Boolean => (physical == PhysicalType::BOOLEAN).then_some(()).ok_or_else(mismatch),
        ColumnType::SmallInt | ColumnType::Int => {
            (physical == PhysicalType::INT32).then_some(()).ok_or_else(mismatch)
        }
        ColumnType::BigInt => (physical == PhysicalType::INT64).then_some(()).ok_or_else(mismatch),
        ColumnType::Float => (physical == PhysicalType::FLOAT).then_some(()).ok_or_else(mismatch),
        ColumnType::Double => (physical == PhysicalType::DOUBLE).then_some(()).ok_or_else(mismatch),
        ColumnType::Text => {
            (physical == PhysicalType::BYTE_ARRAY).then_some(()).ok_or_else(mismatch)
        }
        ColumnType::Timestamp => {
            if physical != PhysicalType::INT64 {
                return Err(mismatch());
            }
            if let Some(LogicalType::Timestamp {
                is_adjusted_to_u_t_c,
                ..
            }) = logical
                && !*is_adjusted_to_u_t_c
            {
                return Err(Error::SourceInvalid(format!(
                    "Non-UTC timezone specified in Parquet file for column \"{name}\". \
                     Only UTC timezone is currently supported."
                )));
            }
            Ok(())
        }
        ColumnType::Array(_) => Err(Error::SourceInvalid(format!(
            "Parquet data wrapper does not support array column \"{}\".",
            column.name
        ))),
    }
}

/// Divisor converting a parquet timestamp value to epoch seconds.
fn timestamp_divisor(logical: Option<&LogicalType>) -> i64 {
    match logical {
        Some(LogicalType::Timestamp { unit, .. }) => match unit {
            TimeUnit::MILLIS(_) => 1_000,
            TimeUnit::MICROS(_) => 1_000_000,
            TimeUnit::NANOS(_) => 1_000_000_000,
        },
        _ => 1,
    }
}

/// Fold one row group's column statistics into the fragment's running chunk
/// metadata.
fn fold_statistics(
    meta: &mut ChunkMetadata,
    column: &ColumnDescriptor,
    stats: &Statistics,
    rows: u64,
    divisor: i64,
) -> Result<()> {
    let (min, max) = match stats {
        Statistics::Boolean(vs) => (
            vs.min_opt().map(|v| ScalarStat::Int(*v as i64)),
            vs.max_opt().map(|v| ScalarStat::Int(*v as i64)),
        ),
        Statistics::Int32(vs) => (
            vs.min_opt().map(|v| ScalarStat::Int(*v as i64)),
            vs.max_opt().map(|v| ScalarStat::Int(*v as i64)),
        ),
        Statistics::Int64(vs) => (
            vs.min_opt().map(|v| ScalarStat::Int(*v / divisor)),
            vs.max_opt().map(|v| ScalarStat::Int(*v / divisor)),
        ),
        Statistics::Float(vs) => (
            vs.min_opt().map(|v| ScalarStat::Float(*v as f64)),
            vs.max_opt().map(|v| ScalarStat::Float(*v as f64)),
        ),
        Statistics::Double(vs) => (
            vs.min_opt().map(|v| ScalarStat::Float(*v)),
            vs.max_opt().map(|v| ScalarStat::Float(*v)),
        ),
        _ => (None, None),
    };
    if let Some(min) = min {
        meta.min.fold_min(min);
    }
    if let Some(max) = max {
        meta.max.fold_max(max);
    }
    if stats.null_count_opt().unwrap_or(0) > 0 {
        meta.has_nulls = true;
    }
    meta.num_elements += rows;
    meta.num_bytes += match column.column_type.fixed_width() {
        Some(width) => rows * width as u64,
        None => rows * 4,
    };
    Ok(())
}

/// One value of an Arrow column as a neutral datum.
fn array_datum(array: &ArrayRef, row: usize) -> Result<Datum> {
    if array.is_null(row) {
        return Ok(Datum::Null);
    }
    let unsupported = || {
        Error::SourceInvalid(format!(
            "Unsupported Arrow type \"{}\" in Parquet file.",
            array.data_type()
        ))
    };
    match array.data_type() {
        DataType::Boolean => {
            let values = array.as_any().downcast_ref::<BooleanArray>().ok_or_else(unsupported)?;
            Ok(Datum::Int(values.value(row) as i64))
        }
        DataType::Int32 => {
            let values = array.as_any().downcast_ref::<Int32Array>().ok_or_else(unsupported)?;
            Ok(Datum::Int(values.value(row) as i64))
        }
        DataType::Int64 => {
            let values = array.as_any().downcast_ref::<Int64Array>().ok_or_else(unsupported)?;
            Ok(Datum::Int(values.value(row)))
        }
        DataType::Float32 => {
            let values = array.as_any().downcast_ref::<Float32Array>().ok_or_else(unsupported)?;
            Ok(Datum::Float(values.value(row) as f64))
        }
        DataType::Float64 => {
            let values = array.as_any().downcast_ref::<Float64Array>().ok_or_else(unsupported)?;
            Ok(Datum::Float(values.value(row)))
        }
        DataType::Utf8 => {
            let values = array.as_any().downcast_ref::<StringArray>().ok_or_else(unsupported)?;
            Ok(Datum::Text(values.value(row).to_string()))
        }
        DataType::Timestamp(unit, _) => {
            let raw = match unit {
                ArrowTimeUnit::Second => array
                    .as_any()
                    .downcast_ref::<TimestampSecondArray>()
                    .ok_or_else(unsupported)?
                    .value(row),
                ArrowTimeUnit::Millisecond => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .ok_or_else(unsupported)?
                        .value(row)
                        / 1_000
                }
                ArrowTimeUnit::Microsecond => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampMicrosecondArray>()
                        .ok_or_else(unsupported)?
                        .value(row)
                        / 1_000_000
                }
                ArrowTimeUnit::Nanosecond => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .ok_or_else(unsupported)?
                        .value(row)
                        / 1_000_000_000
                }
            };
            Ok(Datum::Int(raw))
        }
        _ => Err(unsupported()),
    }
}
