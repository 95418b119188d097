//! Tests for the one-chunk-at-a-time fetch protocol: cache routing, the
//! staging map, variable-length fanout, and the refused write surface.

mod common;

use std::sync::Arc;

use common::{int_table, manager_with_cache, manager_without_cache, options, select_ints};
use fstore_result::Error;
use fstore_types::codec::{decode_i32_chunk, decode_text_chunk, decode_u64_chunk};
use fstore_types::{
    ChunkBuffer, ChunkKey, ChunkMetadataVec, ColumnDescriptor, ColumnType, DataWrapperType,
    ForeignTable, ForeignTableSchema, MemoryCatalog, TablePrefix,
};
use tempfile::TempDir;

/// A `(t TEXT, i INTEGER[])` CSV table over the given source path.
fn text_array_table(table_id: i32, file_path: &std::path::Path) -> ForeignTable {
    let schema = ForeignTableSchema::new(vec![
        ColumnDescriptor::new(1, "t", ColumnType::Text),
        ColumnDescriptor::new(2, "i", ColumnType::Array(Box::new(ColumnType::Int))),
    ])
    .unwrap();
    ForeignTable::from_options(
        1,
        table_id,
        format!("t{table_id}"),
        DataWrapperType::Csv,
        schema,
        &options(&[
            ("file_path", file_path.to_str().unwrap()),
            ("header", "false"),
        ]),
        0,
    )
    .unwrap()
}

#[test]
fn cached_fetch_round_trip() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n3\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(2, &csv, &[]));
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2, 3]);
    let cache = manager.cache().unwrap();
    assert_eq!(cache.cached_chunk_count(), 1);
    assert_eq!(cache.cached_metadata_count(), 1);

    // Second select is served from the cache: no further promotions.
    let chunks_added = cache.num_chunks_added();
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2, 3]);
    assert_eq!(cache.num_chunks_added(), chunks_added);
}

#[test]
fn varlen_fanout_materializes_data_and_index_together() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "a,{1,2}\nb,{3}\nc,{}\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(text_array_table(3, &csv));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    let mut metadata = ChunkMetadataVec::new();
    manager
        .get_chunk_metadata_vec_for_key_prefix(&mut metadata, prefix)
        .unwrap();
    assert_eq!(metadata.len(), 2);

    // Fetch every physical chunk the way the buffer manager would.
    let text_key = ChunkKey::scalar(1, 3, 1, 0);
    let data_key = ChunkKey::varlen_data(1, 3, 2, 0);
    let index_key = ChunkKey::varlen_index(1, 3, 2, 0);

    let text_buffer = ChunkBuffer::handle();
    manager.fetch_buffer(&text_key, &text_buffer, 0).unwrap();
    assert_eq!(
        decode_text_chunk(&text_buffer.to_vec()),
        vec![Some("a".into()), Some("b".into()), Some("c".into())]
    );

    let data_buffer = ChunkBuffer::handle();
    manager.fetch_buffer(&data_key, &data_buffer, 0).unwrap();
    assert_eq!(decode_i32_chunk(&data_buffer.to_vec()), vec![1, 2, 3]);

    // The index sibling was materialized by the same wrapper pass.
    let cache = manager.cache().unwrap();
    assert!(cache.get_cached_chunk_if_exists(&index_key).is_some());

    let index_buffer = ChunkBuffer::handle();
    manager.fetch_buffer(&index_key, &index_buffer, 0).unwrap();
    assert_eq!(decode_u64_chunk(&index_buffer.to_vec()), vec![0, 8, 12, 12]);

    // (t TEXT, i INTEGER[]) over one fragment: 3 chunks, 2 metadata
    // entries.
    assert_eq!(cache.cached_chunk_count(), 3);
    assert_eq!(cache.cached_metadata_count(), 2);
}

#[test]
fn staging_map_holds_siblings_when_cache_is_disabled() {
    let source_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "a,{1,2}\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(text_array_table(4, &csv));
    let manager = manager_without_cache(&catalog);

    let data_key = ChunkKey::varlen_data(1, 4, 2, 0);
    let index_key = ChunkKey::varlen_index(1, 4, 2, 0);

    // Fetching the data chunk stages its index sibling.
    let data_buffer = ChunkBuffer::handle();
    manager.fetch_buffer(&data_key, &data_buffer, 0).unwrap();
    assert_eq!(decode_i32_chunk(&data_buffer.to_vec()), vec![1, 2]);

    // The staged sibling is consumed exactly once.
    let index_buffer = ChunkBuffer::handle();
    manager.fetch_buffer(&index_key, &index_buffer, 0).unwrap();
    assert_eq!(decode_u64_chunk(&index_buffer.to_vec()), vec![0, 8]);

    // A re-fetch misses staging and re-populates through the wrapper.
    let again = ChunkBuffer::handle();
    manager.fetch_buffer(&index_key, &again, 0).unwrap();
    assert_eq!(decode_u64_chunk(&again.to_vec()), vec![0, 8]);
}

#[test]
fn single_key_fetch_without_cache_writes_destination_directly() {
    let source_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "5\n6\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(5, &csv, &[]));
    let manager = manager_without_cache(&catalog);

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![5, 6]);
}

#[test]
fn dirty_destination_buffer_is_rejected() {
    let source_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.register_table(int_table(6, &csv, &[]));
    let manager = manager_without_cache(&catalog);

    let dst = ChunkBuffer::handle();
    dst.append(&[0]);
    let err = manager
        .fetch_buffer(&ChunkKey::scalar(1, 6, 1, 0), &dst, 0)
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[test]
fn column_count_mismatch_is_source_invalid() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "random text\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(text_array_table(7, &csv));
    let manager = manager_with_cache(&catalog, cache_dir.path());

    let err = select_ints(&manager, &table).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Mismatched number of logical columns: (expected 2 columns, has 1): random text"
    );
}

#[test]
fn write_surface_is_refused() {
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = manager_without_cache(&catalog);
    let key = ChunkKey::scalar(1, 1, 1, 0);
    let buffer = ChunkBuffer::handle();

    assert!(matches!(manager.create_buffer(&key), Err(Error::Unsupported(_))));
    assert!(matches!(manager.put_buffer(&key, &buffer), Err(Error::Unsupported(_))));
    assert!(matches!(manager.delete_buffer(&key), Err(Error::Unsupported(_))));
    assert!(matches!(manager.checkpoint(), Err(Error::Unsupported(_))));
    assert!(matches!(manager.alloc(16), Err(Error::Unsupported(_))));
    assert!(matches!(manager.free(buffer), Err(Error::Unsupported(_))));
}

#[test]
fn write_statements_are_rejected() {
    let source_dir = TempDir::new().unwrap();
    let table = int_table(8, &source_dir.path().join("d.csv"), &[]);
    let err = table.check_write_allowed().unwrap_err();
    assert_eq!(
        err.to_string(),
        "DELETE, INSERT, OR UPDATE commands are not supported for foreign tables."
    );
}

#[test]
fn drop_table_clears_wrapper_cache_and_staging() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(9, &csv, &[]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    select_ints(&manager, &table).unwrap();
    assert!(manager.has_data_wrapper(prefix));
    assert!(manager.cache().unwrap().cached_chunk_count() > 0);

    manager.remove_table_related_ds(1, 9).unwrap();
    assert!(!manager.has_data_wrapper(prefix));
    assert_eq!(manager.cache().unwrap().cached_chunk_count(), 0);
    assert!(!manager
        .cache()
        .unwrap()
        .has_cached_metadata_for_key_prefix(TablePrefix::new(1, 9)));
}
