//! CSV wrapper integration tests: metadata scans over files, directories,
//! and archives; span-based buffer population; serialize/restore; append
//! validation.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use fstore_types::codec::{decode_i32_chunk, decode_text_chunk};
use fstore_types::{
    ChunkBuffer, ChunkKey, ChunkMetadataVec, ColumnDescriptor, ColumnType, DataWrapperType,
    ForeignTable, ForeignTableSchema, ScalarStat,
};
use fstore_wrapper::{ChunkBufferMap, CsvDataWrapper, ForeignDataWrapper};
use tempfile::TempDir;

fn table_with(
    file_path: &Path,
    columns: Vec<ColumnDescriptor>,
    extra: &[(&str, &str)],
) -> Arc<ForeignTable> {
    let mut options: HashMap<String, String> = [
        ("file_path".to_string(), file_path.to_string_lossy().into_owned()),
        ("header".to_string(), "false".to_string()),
    ]
    .into();
    for (k, v) in extra {
        options.insert(k.to_string(), v.to_string());
    }
    Arc::new(
        ForeignTable::from_options(
            1,
            2,
            "t",
            DataWrapperType::Csv,
            ForeignTableSchema::new(columns).unwrap(),
            &options,
            0,
        )
        .unwrap(),
    )
}

fn int_columns() -> Vec<ColumnDescriptor> {
    vec![ColumnDescriptor::new(1, "i", ColumnType::Int)]
}

fn populate_one(wrapper: &CsvDataWrapper, key: ChunkKey) -> Vec<u8> {
    let mut required = ChunkBufferMap::new();
    required.insert(key.clone(), ChunkBuffer::handle());
    wrapper
        .populate_chunk_buffers(&required, &ChunkBufferMap::new())
        .unwrap();
    required[&key].to_vec()
}

#[test]
fn metadata_scan_assigns_fragments_and_stats() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "3\n1\nNA\n7\n").unwrap();

    let table = table_with(&csv, int_columns(), &[("fragment_size", "3")]);
    let wrapper = CsvDataWrapper::new(table);

    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 2);

    let (key0, meta0) = &metadata[0];
    assert_eq!(*key0, ChunkKey::scalar(1, 2, 1, 0));
    assert_eq!(meta0.num_elements, 3);
    assert_eq!(meta0.min, ScalarStat::Int(1));
    assert_eq!(meta0.max, ScalarStat::Int(3));
    assert!(meta0.has_nulls);

    let (key1, meta1) = &metadata[1];
    assert_eq!(*key1, ChunkKey::scalar(1, 2, 1, 1));
    assert_eq!(meta1.num_elements, 1);
    assert!(!meta1.has_nulls);

    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 1))),
        vec![7]
    );
}

#[test]
fn directory_source_spans_fragment_across_files() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.csv"), "1\n2\n").unwrap();
    std::fs::write(data.join("b.csv"), "3\n4\n").unwrap();

    let table = table_with(&data, int_columns(), &[("fragment_size", "3")]);
    let wrapper = CsvDataWrapper::new(table);

    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 2);

    // Fragment 0 crosses the file boundary: rows 1, 2 from a.csv and row 3
    // from b.csv.
    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 0))),
        vec![1, 2, 3]
    );
    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 1))),
        vec![4]
    );
}

#[test]
fn header_rows_are_skipped_per_file() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "t,i\na,1\nb,2\n").unwrap();

    let table = table_with(
        &csv,
        vec![
            ColumnDescriptor::new(1, "t", ColumnType::Text),
            ColumnDescriptor::new(2, "i", ColumnType::Int),
        ],
        &[("header", "true")],
    );
    let wrapper = CsvDataWrapper::new(table);
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata[0].1.num_elements, 2);

    assert_eq!(
        decode_text_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 0))),
        vec![Some("a".into()), Some("b".into())]
    );
}

#[test]
fn serialize_restore_round_trip_produces_identical_bytes() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n3\n").unwrap();
    let state_path = dir.path().join("wrapper_metadata.json");

    let table = table_with(&csv, int_columns(), &[("fragment_size", "2")]);
    let mut metadata = ChunkMetadataVec::new();
    let bytes_before;
    {
        let wrapper = CsvDataWrapper::new(Arc::clone(&table));
        wrapper.populate_chunk_metadata(&mut metadata).unwrap();
        wrapper.serialize_data_wrapper_internals(&state_path).unwrap();
        bytes_before = populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 0));
        assert!(!wrapper.is_restored());
    }

    // A fresh wrapper restores without scanning and produces the same
    // bytes for the same keys.
    let wrapper = CsvDataWrapper::new(table);
    wrapper
        .restore_data_wrapper_internals(&state_path, &metadata)
        .unwrap();
    assert!(wrapper.is_restored());
    assert_eq!(populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 0)), bytes_before);
}

#[test]
fn append_rescan_extends_the_last_fragment() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n3\n").unwrap();

    let table = table_with(
        &csv,
        int_columns(),
        &[("fragment_size", "2"), ("refresh_update_type", "APPEND")],
    );
    let wrapper = CsvDataWrapper::new(table);

    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 2);

    // Grow the file: the partially-filled last fragment absorbs the new
    // row, then new fragments follow.
    std::fs::write(&csv, "1\n2\n3\n4\n5\n").unwrap();
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 3);

    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 1))),
        vec![3, 4]
    );
    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 2))),
        vec![5]
    );
}

#[test]
fn append_rescan_picks_up_new_directory_files() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.csv"), "1\n").unwrap();

    let table = table_with(
        &data,
        int_columns(),
        &[("fragment_size", "1"), ("refresh_update_type", "APPEND")],
    );
    let wrapper = CsvDataWrapper::new(table);

    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 1);

    std::fs::write(data.join("b.csv"), "2\n3\n").unwrap();
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 3);
    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 2))),
        vec![3]
    );
}

#[test]
fn append_ignores_growth_in_non_tail_files() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.csv"), "1\n").unwrap();
    std::fs::write(data.join("b.csv"), "2\n").unwrap();

    let table = table_with(
        &data,
        int_columns(),
        &[("fragment_size", "1"), ("refresh_update_type", "APPEND")],
    );
    let wrapper = CsvDataWrapper::new(table);

    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 2);

    // Rows appended to a file that is not the scan tail are not read.
    std::fs::write(data.join("a.csv"), "1\n9\n").unwrap();
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(metadata.len(), 2);
}

#[test]
fn append_shrink_and_missing_entry_errors() {
    let dir = TempDir::new().unwrap();

    // Plain file shrink.
    let csv = dir.path().join("rows.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();
    let table = table_with(&csv, int_columns(), &[("refresh_update_type", "APPEND")]);
    let wrapper = CsvDataWrapper::new(table);
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    std::fs::write(&csv, "1\n").unwrap();
    let err = wrapper
        .populate_chunk_metadata(&mut ChunkMetadataVec::new())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Refresh of foreign table created with APPEND update mode failed as file reduced in size: \"rows.csv\"."
    );

    // Missing archive entry.
    let archive = dir.path().join("archive.zip");
    let write_archive = |entries: &[(&str, &str)]| {
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    };
    write_archive(&[("one.csv", "1\n"), ("two.csv", "2\n")]);
    let table = table_with(&archive, int_columns(), &[("refresh_update_type", "APPEND")]);
    let wrapper = CsvDataWrapper::new(table);
    wrapper
        .populate_chunk_metadata(&mut ChunkMetadataVec::new())
        .unwrap();
    write_archive(&[("one.csv", "1\n")]);
    let err = wrapper
        .populate_chunk_metadata(&mut ChunkMetadataVec::new())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Foreign table refreshed with APPEND mode missing archive entry \"two.csv\" from file \"archive.zip\"."
    );
}

#[test]
fn archive_source_reads_entries_in_name_order() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("data.zip");
    {
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("z_last.csv", options).unwrap();
        writer.write_all(b"3\n").unwrap();
        writer.start_file("a_first.csv", options).unwrap();
        writer.write_all(b"1\n2\n").unwrap();
        writer.finish().unwrap();
    }

    let table = table_with(&archive, int_columns(), &[]);
    let wrapper = CsvDataWrapper::new(table);
    let mut metadata = ChunkMetadataVec::new();
    wrapper.populate_chunk_metadata(&mut metadata).unwrap();
    assert_eq!(
        decode_i32_chunk(&populate_one(&wrapper, ChunkKey::scalar(1, 2, 1, 0))),
        vec![1, 2, 3]
    );
}

#[test]
fn buffer_exhaustion_error_surfaces_through_the_wrapper() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "a,{1,1,1}\naa,{'NA', 2, 2},xxxxxx\n").unwrap();

    let table = table_with(
        &csv,
        vec![
            ColumnDescriptor::new(1, "t", ColumnType::Text),
            ColumnDescriptor::new(2, "i", ColumnType::Array(Box::new(ColumnType::Int))),
        ],
        &[("buffer_size", "10")],
    );
    let wrapper = CsvDataWrapper::new(table);
    wrapper.set_max_buffer_resize(15);

    let err = wrapper
        .populate_chunk_metadata(&mut ChunkMetadataVec::new())
        .unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("Unable to find an end of line character after reading 14 characters."));
    assert!(message.ends_with("Row number: 2. First few characters in row: aa,{'NA', 2, 2"));
}

#[test]
fn bad_extension_in_directory_is_rejected() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.csv"), "1\n").unwrap();
    std::fs::write(data.join("junk.tmp"), "x").unwrap();

    let table = table_with(&data, int_columns(), &[]);
    let wrapper = CsvDataWrapper::new(table);
    let err = wrapper
        .populate_chunk_metadata(&mut ChunkMetadataVec::new())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Invalid extention for file \"{}\".", data.join("junk.tmp").display())
    );
}
