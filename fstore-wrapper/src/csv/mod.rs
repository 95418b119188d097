//! Delimited-text data wrapper.
//!
//! The wrapper scans its sources once to assign rows to fragments and
//! compute chunk metadata, recording per-fragment byte spans so a later
//! `populate_chunk_buffers` seeks straight to the fragment instead of
//! re-reading the table. The span table (plus source sizes) is what gets
//! serialized for recovery.
//!
//! In append mode a rescan re-reads only the last fragment and any new
//! bytes; a source that shrank or lost an archive entry fails the scan.

pub(crate) mod parser;

use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fstore_result::{Error, Result};
use fstore_types::{ChunkKey, ChunkMetadataVec, ForeignTable, ForeignTableSchema};
use serde::{Deserialize, Serialize};

use crate::encoder::{ColumnChunkEncoder, EncodedChunk};
use crate::source::{SourceFile, SourceLocation, enumerate_sources, open_source_at};
use crate::{ChunkBufferMap, ForeignDataWrapper};
use parser::{RowScanner, parse_datum, split_fields};

const CSV_WRAPPER_VERSION: u32 = 1;

/// Default cap on the delimited parser's row buffer. Per wrapper instance;
/// tests shrink it to provoke the exhaustion error.
pub const DEFAULT_MAX_BUFFER_RESIZE: usize = 1 << 30;

/// Byte range of one source contributing rows to a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SourceSpan {
    source: usize,
    start: u64,
    end: u64,
    rows: u64,
}

/// One fragment's rows, as byte spans over the enumerated sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FragmentSpan {
    fragment_id: i32,
    row_count: u64,
    spans: Vec<SourceSpan>,
}

/// The wrapper state persisted to `wrapper_metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CsvWrapperSnapshot {
    version: u32,
    sources: Vec<SourceFile>,
    fragments: Vec<FragmentSpan>,
    total_rows: u64,
}

#[derive(Debug, Clone)]
struct WrapperState {
    snapshot: CsvWrapperSnapshot,
    /// Metadata for every chunk of the table, fragment-major. Rebuilt by a
    /// scan or handed in through restore.
    chunk_metadata: ChunkMetadataVec,
}

/// A stretch of source bytes to scan: a recorded span, a source tail, or a
/// whole source (honoring the header option).
#[derive(Debug, Clone)]
struct Segment {
    source: usize,
    start: u64,
    end: Option<u64>,
    skip_header: bool,
}

/// Scan output for one fragment: its span plus the encoded chunk of every
/// column, in schema order.
struct ScannedFragment {
    span: FragmentSpan,
    chunks: Vec<EncodedChunk>,
}

pub struct CsvDataWrapper {
    table: Arc<ForeignTable>,
    state: Mutex<Option<WrapperState>>,
    restored: AtomicBool,
    max_buffer_resize: AtomicUsize,
}

impl CsvDataWrapper {
    pub fn new(table: Arc<ForeignTable>) -> Self {
        Self {
            table,
            state: Mutex::new(None),
            restored: AtomicBool::new(false),
            max_buffer_resize: AtomicUsize::new(DEFAULT_MAX_BUFFER_RESIZE),
        }
    }

    /// Cap on the delimited parser's row buffer for this wrapper instance.
    pub fn set_max_buffer_resize(&self, bytes: usize) {
        self.max_buffer_resize.store(bytes, Ordering::Release);
    }

    fn max_buffer_resize(&self) -> usize {
        self.max_buffer_resize.load(Ordering::Acquire)
    }

    fn full_scan(&self) -> Result<WrapperState> {
        let sources = enumerate_sources(&self.table.file_path)?;
        let segments: Vec<Segment> = (0..sources.len())
            .map(|source| Segment {
                source,
                start: 0,
                end: None,
                skip_header: self.table.csv.header,
            })
            .collect();
        let scanned = scan_segments(
            &self.table,
            &sources,
            &segments,
            0,
            self.table.fragment_size,
            self.max_buffer_resize(),
        )?;
        Ok(assemble_state(&self.table, sources, Vec::new(), ChunkMetadataVec::new(), scanned))
    }

    /// Validate the sources against the prior scan, then rescan only the
    /// last fragment, the tail of the last source, and any new sources.
    fn append_scan(&self, prior: &WrapperState) -> Result<WrapperState> {
        let fresh = enumerate_sources(&self.table.file_path)?;
        let mut sources = Vec::with_capacity(fresh.len());
        for prior_source in &prior.snapshot.sources {
            match fresh.iter().find(|s| s.location == prior_source.location) {
                None => return Err(missing_source_error(&prior_source.location)),
                Some(found) if found.size < prior_source.size => {
                    return Err(Error::SourceShrunk {
                        file: prior_source.location.display_name(),
                    });
                }
                Some(found) => sources.push(found.clone()),
            }
        }
        for source in &fresh {
            if !prior.snapshot.sources.iter().any(|p| p.location == source.location) {
                sources.push(source.clone());
            }
        }

        let mut segments = Vec::new();
        let mut kept_fragments = Vec::new();
        let mut kept_metadata = ChunkMetadataVec::new();
        let mut first_fragment_id = 0;
        match prior.snapshot.fragments.split_last() {
            None => {
                for source in 0..sources.len() {
                    segments.push(Segment {
                        source,
                        start: 0,
                        end: None,
                        skip_header: self.table.csv.header,
                    });
                }
            }
            Some((last, head)) => {
                kept_fragments = head.to_vec();
                kept_metadata = prior
                    .chunk_metadata
                    .iter()
                    .filter(|(key, _)| key.fragment_id() < last.fragment_id)
                    .cloned()
                    .collect();
                first_fragment_id = last.fragment_id;
                for span in &last.spans {
                    segments.push(Segment {
                        source: span.source,
                        start: span.start,
                        end: Some(span.end),
                        skip_header: false,
                    });
                }
                let last_source = prior.snapshot.sources.len() - 1;
                let scanned_size = prior.snapshot.sources[last_source].size;
                if sources[last_source].size > scanned_size {
                    segments.push(Segment {
                        source: last_source,
                        start: scanned_size,
                        end: None,
                        skip_header: false,
                    });
                }
                for source in prior.snapshot.sources.len()..sources.len() {
                    segments.push(Segment {
                        source,
                        start: 0,
                        end: None,
                        skip_header: self.table.csv.header,
                    });
                }
            }
        }

        let scanned = scan_segments(
            &self.table,
            &sources,
            &segments,
            first_fragment_id,
            self.table.fragment_size,
            self.max_buffer_resize(),
        )?;
        tracing::debug!(
            table = %self.table.name,
            first_fragment_id,
            rescanned_fragments = scanned.len(),
            "append rescan complete"
        );
        Ok(assemble_state(&self.table, sources, kept_fragments, kept_metadata, scanned))
    }
}

impl ForeignDataWrapper for CsvDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVec) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let new_state = match guard.as_ref() {
            Some(prior) if self.table.is_append_mode() => self.append_scan(prior)?,
            _ => self.full_scan()?,
        };
        out.extend(new_state.chunk_metadata.iter().cloned());
        *guard = Some(new_state);
        Ok(())
    }

    fn populate_chunk_buffers(
        &self,
        required: &ChunkBufferMap,
        optional: &ChunkBufferMap,
    ) -> Result<()> {
        let fragment_id = validate_one_fragment(&self.table, required, optional)?;
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

        let segments: Vec<Segment> = fragment
            .spans
            .iter()
            .map(|span| Segment {
                source: span.source,
                start: span.start,
                end: Some(span.end),
                skip_header: false,
            })
            .collect();
        let mut scanned = scan_segments(
            &self.table,
            &state.snapshot.sources,
            &segments,
            fragment.fragment_id,
            fragment.row_count.max(1) as usize,
            self.max_buffer_resize(),
        )?;
        let scanned = match scanned.len() {
            1 => scanned.remove(0),
            n => {
                return Err(Error::Internal(format!(
                    "fragment {fragment_id} rescan produced {n} fragments"
                )));
            }
        };

        deliver_chunks(&self.table, &scanned, required, optional)
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
        let snapshot: CsvWrapperSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != CSV_WRAPPER_VERSION {
            return Err(Error::Internal(format!(
                "unsupported wrapper metadata version {} (expected {CSV_WRAPPER_VERSION})",
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

fn missing_source_error(location: &SourceLocation) -> Error {
    match location {
        SourceLocation::File { .. } => Error::SourceShrunk {
            file: location.display_name(),
        },
        SourceLocation::ArchiveEntry { archive, entry } => Error::SourceMemberGone {
            entry: crate::source::file_name(Path::new(entry)),
            archive: crate::source::file_name(Path::new(archive)),
        },
    }
}

/// Every buffer key must name this wrapper's table and one shared fragment.
fn validate_one_fragment(
    table: &ForeignTable,
    required: &ChunkBufferMap,
    optional: &ChunkBufferMap,
) -> Result<i32> {
    let first = required
        .keys()
        .next()
        .ok_or_else(|| Error::Internal("populate_chunk_buffers called with no required buffers".into()))?;
    let fragment_id = first.fragment_id();
    for key in required.keys().chain(optional.keys()) {
        if key.table_prefix() != table.table_prefix() || key.fragment_id() != fragment_id {
            return Err(Error::Internal(format!(
                "chunk key {:?} is outside the populated fragment",
                key.parts()
            )));
        }
    }
    Ok(fragment_id)
}

/// Copy scanned chunk bytes into the buffers that asked for them.
fn deliver_chunks(
    table: &ForeignTable,
    scanned: &ScannedFragment,
    required: &ChunkBufferMap,
    optional: &ChunkBufferMap,
) -> Result<()> {
    let fragment_id = scanned.span.fragment_id;
    let mut delivered = 0usize;
    let mut deliver = |key: &ChunkKey, bytes: &[u8]| {
        if let Some(buffer) = required.get(key) {
            buffer.write(bytes);
            delivered += 1;
        } else if let Some(buffer) = optional.get(key) {
            buffer.write(bytes);
        }
    };
    for (column, chunk) in table.schema.columns().iter().zip(&scanned.chunks) {
        let data_key = column_data_key(table, column.column_id, fragment_id);
        deliver(&data_key, &chunk.data);
        if let Some(index) = &chunk.index {
            let index_key =
                ChunkKey::varlen_index(table.db_id, table.table_id, column.column_id, fragment_id);
            deliver(&index_key, index);
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

/// The key under which a column's data chunk (and its metadata) lives.
fn column_data_key(table: &ForeignTable, column_id: i32, fragment_id: i32) -> ChunkKey {
    let column = table
        .schema
        .columns()
        .iter()
        .find(|c| c.column_id == column_id);
    match column {
        Some(c) if c.column_type.is_varlen_indeed() => {
            ChunkKey::varlen_data(table.db_id, table.table_id, column_id, fragment_id)
        }
        _ => ChunkKey::scalar(table.db_id, table.table_id, column_id, fragment_id),
    }
}

fn assemble_state(
    table: &ForeignTable,
    sources: Vec<SourceFile>,
    kept_fragments: Vec<FragmentSpan>,
    kept_metadata: ChunkMetadataVec,
    scanned: Vec<ScannedFragment>,
) -> WrapperState {
    let mut fragments = kept_fragments;
    let mut chunk_metadata = kept_metadata;
    for fragment in &scanned {
        for (column, chunk) in table.schema.columns().iter().zip(&fragment.chunks) {
            let key = column_data_key(table, column.column_id, fragment.span.fragment_id);
            chunk_metadata.push((key, chunk.metadata));
        }
        fragments.push(fragment.span.clone());
    }
    let total_rows = fragments.iter().map(|f| f.row_count).sum();
    WrapperState {
        snapshot: CsvWrapperSnapshot {
            version: CSV_WRAPPER_VERSION,
            sources,
            fragments,
            total_rows,
        },
        chunk_metadata,
    }
}

/// Stream the given segments through the parser, packing rows into
/// fragments of `fragment_size` starting at `first_fragment_id`.
fn scan_segments(
    table: &ForeignTable,
    sources: &[SourceFile],
    segments: &[Segment],
    first_fragment_id: i32,
    fragment_size: usize,
    max_buffer_resize: usize,
) -> Result<Vec<ScannedFragment>> {
    let schema = &table.schema;
    let opts = &table.csv;
    let mut fragments = Vec::new();
    let mut builder = FragmentBuilder::new(schema, first_fragment_id);

    for segment in segments {
        let location = &sources[segment.source].location;
        let reader = open_source_at(location, segment.start)?;
        let reader: Box<dyn std::io::Read + Send> = match segment.end {
            Some(end) => Box::new(reader.take(end - segment.start)),
            None => reader,
        };
        let mut scanner = RowScanner::new(reader, opts, max_buffer_resize, segment.start);
        if segment.skip_header {
            scanner.skip_header()?;
        }
        while let Some(row) = scanner.next_row()? {
            if row.bytes.is_empty() {
                continue;
            }
            let fields = split_fields(&row.bytes, opts);
            if fields.len() != schema.num_logical_columns() {
                return Err(Error::SourceInvalid(format!(
                    "Mismatched number of logical columns: (expected {} columns, has {}): {}",
                    schema.num_logical_columns(),
                    fields.len(),
                    String::from_utf8_lossy(&row.bytes)
                )));
            }
            let mut datums = Vec::with_capacity(fields.len());
            for (field, column) in fields.iter().zip(schema.columns()) {
                datums.push(parse_datum(field, &column.column_type, opts)?);
            }
            builder.push_row(segment.source, row.start, row.end, &datums)?;
            if builder.row_count == fragment_size as u64 {
                let next_id = builder.fragment_id + 1;
                fragments.push(builder.finish());
                builder = FragmentBuilder::new(schema, next_id);
            }
        }
        builder.close_source();
    }
    if builder.row_count > 0 {
        fragments.push(builder.finish());
    }
    Ok(fragments)
}

struct FragmentBuilder<'a> {
    schema: &'a ForeignTableSchema,
    fragment_id: i32,
    encoders: Vec<ColumnChunkEncoder>,
    row_count: u64,
    spans: Vec<SourceSpan>,
    current: Option<SourceSpan>,
}

impl<'a> FragmentBuilder<'a> {
    fn new(schema: &'a ForeignTableSchema, fragment_id: i32) -> Self {
        Self {
            schema,
            fragment_id,
            encoders: schema
                .columns()
                .iter()
                .map(|c| ColumnChunkEncoder::new(c.column_type.clone()))
                .collect(),
            row_count: 0,
            spans: Vec::new(),
            current: None,
        }
    }

    fn push_row(
        &mut self,
        source: usize,
        start: u64,
        end: u64,
        datums: &[crate::encoder::Datum],
    ) -> Result<()> {
        for (encoder, datum) in self.encoders.iter_mut().zip(datums) {
            encoder.push(datum)?;
        }
        match &mut self.current {
            Some(span) if span.source == source => {
                span.end = end;
                span.rows += 1;
            }
            _ => {
                self.close_source();
                self.current = Some(SourceSpan {
                    source,
                    start,
                    end,
                    rows: 1,
                });
            }
        }
        self.row_count += 1;
        Ok(())
    }

    fn close_source(&mut self) {
        if let Some(span) = self.current.take()
            && span.rows > 0
        {
            self.spans.push(span);
        }
    }

    fn finish(mut self) -> ScannedFragment {
        self.close_source();
        ScannedFragment {
            span: FragmentSpan {
                fragment_id: self.fragment_id,
                row_count: self.row_count,
                spans: self.spans,
            },
            chunks: self.encoders.into_iter().map(ColumnChunkEncoder::finish).collect(),
        }
    }
}
