//! Shared helpers for the storage manager integration tests.
//!
//! `select_ints` mimics what the executor does for `SELECT *`: a metadata
//! query against the manager, then one `fetch_buffer` per chunk.
//! `count_rows` mimics `SELECT COUNT(*)`: the metadata query alone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use fstore_cache::ForeignStorageCache;
use fstore_core::ForeignStorageMgr;
use fstore_result::Result;
use fstore_types::codec::decode_i32_chunk;
use fstore_types::{
    ChunkBuffer, ChunkKey, ChunkMetadataVec, ColumnDescriptor, ColumnType, DataWrapperType,
    ForeignTable, ForeignTableCatalog, ForeignTableSchema, MemoryCatalog,
};

pub fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A `(i INTEGER)` CSV table without a header row, plus any extra options.
pub fn int_table(table_id: i32, file_path: &Path, extra: &[(&str, &str)]) -> ForeignTable {
    let schema =
        ForeignTableSchema::new(vec![ColumnDescriptor::new(1, "i", ColumnType::Int)]).unwrap();
    let mut pairs = vec![
        ("file_path".to_string(), file_path.to_string_lossy().into_owned()),
        ("header".to_string(), "false".to_string()),
    ];
    for (k, v) in extra {
        pairs.push((k.to_string(), v.to_string()));
    }
    ForeignTable::from_options(
        1,
        table_id,
        format!("t{table_id}"),
        DataWrapperType::Csv,
        schema,
        &pairs.into_iter().collect(),
        0,
    )
    .unwrap()
}

pub fn manager_with_cache(
    catalog: &Arc<MemoryCatalog>,
    cache_dir: &Path,
) -> Arc<ForeignStorageMgr> {
    let cache = Arc::new(ForeignStorageCache::new(cache_dir).unwrap());
    let catalog: Arc<dyn ForeignTableCatalog> = catalog.clone();
    Arc::new(ForeignStorageMgr::new(catalog, Some(cache)))
}

pub fn manager_without_cache(catalog: &Arc<MemoryCatalog>) -> Arc<ForeignStorageMgr> {
    let catalog: Arc<dyn ForeignTableCatalog> = catalog.clone();
    Arc::new(ForeignStorageMgr::new(catalog, None))
}

/// `SELECT i FROM t ORDER BY fragment`: metadata query, then a fetch per
/// integer chunk.
pub fn select_ints(manager: &ForeignStorageMgr, table: &ForeignTable) -> Result<Vec<i32>> {
    let prefix = table.table_prefix();
    let mut metadata = ChunkMetadataVec::new();
    manager.get_chunk_metadata_vec_for_key_prefix(&mut metadata, prefix)?;
    let mut keys: Vec<ChunkKey> = metadata
        .iter()
        .filter(|(key, _)| key.column_id() == 1)
        .map(|(key, _)| key.clone())
        .collect();
    keys.sort();
    let mut values = Vec::new();
    for key in keys {
        let dst = ChunkBuffer::handle();
        manager.fetch_buffer(&key, &dst, 0)?;
        values.extend(decode_i32_chunk(&dst.to_vec()));
    }
    Ok(values)
}

/// `SELECT COUNT(*)`: answered from metadata alone.
pub fn count_rows(manager: &ForeignStorageMgr, table: &ForeignTable) -> Result<u64> {
    let mut metadata = ChunkMetadataVec::new();
    manager.get_chunk_metadata_vec_for_key_prefix(&mut metadata, table.table_prefix())?;
    Ok(metadata
        .iter()
        .filter(|(key, _)| key.column_id() == 1)
        .map(|(_, meta)| meta.num_elements)
        .sum())
}
