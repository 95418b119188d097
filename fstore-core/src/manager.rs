//! The foreign storage manager: the pull→populate adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fstore_cache::ForeignStorageCache;
use fstore_result::{Error, Result};
use fstore_types::{
    BufferHandle, ChunkBuffer, ChunkKey, ChunkMetadataVec, ForeignTableCatalog, TablePrefix,
};
use fstore_wrapper::{
    ChunkBufferMap, ForeignDataWrapper, MockForeignDataWrapper, WRAPPER_METADATA_FILE,
    create_data_wrapper,
};
use rustc_hash::FxHashMap;

/// Default wall-clock budget for re-populating warm chunks in one refresh.
pub const DEFAULT_REFRESH_TIME_BUDGET: Duration = Duration::from_secs(60 * 60);

pub struct ForeignStorageMgr {
    pub(crate) catalog: Arc<dyn ForeignTableCatalog>,
    pub(crate) cache: Option<Arc<ForeignStorageCache>>,
    /// One wrapper per table, created lazily on first access. Lookup is the
    /// hot path; creation is rare. Never held across a wrapper call.
    wrappers: RwLock<FxHashMap<TablePrefix, Arc<dyn ForeignDataWrapper>>>,
    /// Sibling chunks produced as a side effect of a fetch while the cache
    /// is disabled; each entry is consumed exactly once.
    staging: Mutex<BTreeMap<ChunkKey, BufferHandle>>,
    pub(crate) refresh_time_budget: Mutex<Duration>,
}

impl ForeignStorageMgr {
    pub fn new(
        catalog: Arc<dyn ForeignTableCatalog>,
        cache: Option<Arc<ForeignStorageCache>>,
    ) -> Self {
        Self {
            catalog,
            cache,
            wrappers: RwLock::new(FxHashMap::default()),
            staging: Mutex::new(BTreeMap::new()),
            refresh_time_budget: Mutex::new(DEFAULT_REFRESH_TIME_BUDGET),
        }
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&Arc<ForeignStorageCache>> {
        self.cache.as_ref()
    }

    pub fn catalog(&self) -> Arc<dyn ForeignTableCatalog> {
        Arc::clone(&self.catalog)
    }

    /// Override the refresh wall-clock budget (tests shrink it).
    pub fn set_refresh_time_budget(&self, budget: Duration) {
        *self.refresh_time_budget.lock().unwrap() = budget;
    }

    /// Materialize one chunk into `dst`.
    ///
    /// Probes the cache (or the staging map when caching is off); on a miss
    /// the requested key fans out to every sibling the wrapper populates in
    /// one pass, the wrapper fills cache- or staging-owned buffers, and the
    /// whole fanout set is promoted to durable. `dst` is fully written or
    /// unchanged.
    pub fn fetch_buffer(
        &self,
        chunk_key: &ChunkKey,
        destination_buffer: &BufferHandle,
        num_bytes: usize,
    ) -> Result<()> {
        chunk_key.validate()?;
        if destination_buffer.is_dirty() {
            return Err(Error::Internal(
                "fetch_buffer called with a dirty destination buffer".into(),
            ));
        }

        let mut cached = true;
        let mut buffer = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get_cached_chunk_if_exists(chunk_key));
        let mut buffer_from_staging = false;
        if self.cache.is_none()
            && let Some(staged) = self.staging.lock().unwrap().get(chunk_key)
        {
            buffer = Some(BufferHandle::clone(staged));
            buffer_from_staging = true;
        }

        let mut chunk_keys = Vec::new();
        if buffer.is_none() {
            let prefix = chunk_key.table_prefix();
            if self.create_data_wrapper_if_not_exists(prefix)? {
                // Prefer recovering the wrapper from disk over a source scan.
                if !self.recover_data_wrapper_from_disk(prefix)? {
                    self.scan_and_cache_metadata(prefix)?;
                }
            }
            cached = false;
            let required = self.chunk_buffers_to_populate(chunk_key, destination_buffer, &mut chunk_keys)?;
            let src = required.get(chunk_key).map(BufferHandle::clone).ok_or_else(|| {
                Error::Internal(format!(
                    "fanout buffers for chunk key {:?} do not include the requested key",
                    chunk_key.parts()
                ))
            })?;
            self.data_wrapper(prefix)?
                .populate_chunk_buffers(&required, &ChunkBufferMap::new())?;
            buffer = Some(src);
        }

        let src = buffer.ok_or_else(|| Error::Internal("chunk buffer resolution failed".into()))?;
        // The wrapper wrote into `dst` directly only in the cache-disabled,
        // no-sibling case.
        if !Arc::ptr_eq(&src, destination_buffer) {
            src.copy_to(destination_buffer, num_bytes)?;
        }

        if buffer_from_staging {
            self.staging.lock().unwrap().remove(chunk_key);
        }

        if let Some(cache) = &self.cache
            && !cached
        {
            cache.cache_table_chunks(&chunk_keys)?;
        }
        Ok(())
    }

    /// Buffers for the fanout set of `destination_chunk_key`: cache-owned
    /// when caching is on; otherwise `dst` for the requested key plus
    /// staging-owned buffers for every sibling.
    fn chunk_buffers_to_populate(
        &self,
        destination_chunk_key: &ChunkKey,
        destination_buffer: &BufferHandle,
        chunk_keys: &mut Vec<ChunkKey>,
    ) -> Result<ChunkBufferMap> {
        let table = self.catalog.foreign_table(destination_chunk_key.table_prefix())?;
        *chunk_keys = table.schema.fanout_keys(destination_chunk_key)?;

        if let Some(cache) = &self.cache {
            return cache.get_chunk_buffers_for_caching(chunk_keys);
        }

        let mut chunk_buffer_map = ChunkBufferMap::new();
        chunk_buffer_map.insert(destination_chunk_key.clone(), BufferHandle::clone(destination_buffer));
        if chunk_keys.len() > 1 {
            let mut staging = self.staging.lock().unwrap();
            for key in chunk_keys.iter() {
                if key != destination_chunk_key {
                    let staged = ChunkBuffer::handle();
                    staging.insert(key.clone(), BufferHandle::clone(&staged));
                    chunk_buffer_map.insert(key.clone(), staged);
                }
            }
        } else if chunk_keys[0] != *destination_chunk_key {
            return Err(Error::Internal(format!(
                "single-key fanout for {:?} produced a different key",
                destination_chunk_key.parts()
            )));
        }
        Ok(chunk_buffer_map)
    }

    /// Metadata for one table, for planner-side queries. Served from the
    /// cache when warm; recovered from disk without instantiating a wrapper
    /// when possible; scanned otherwise.
    pub fn get_chunk_metadata_vec_for_key_prefix(
        &self,
        chunk_metadata: &mut ChunkMetadataVec,
        prefix: TablePrefix,
    ) -> Result<()> {
        if let Some(cache) = &self.cache {
            if cache.has_cached_metadata_for_key_prefix(prefix) {
                cache.get_cached_metadata_vec_for_key_prefix(chunk_metadata, prefix);
                return Ok(());
            }
            // A table that was never touched in this process may recover
            // its metadata from disk with no wrapper at all.
            if !self.has_data_wrapper(prefix)
                && cache.recover_cache_for_table(chunk_metadata, prefix)?
            {
                return Ok(());
            }
        }
        self.create_data_wrapper_if_not_exists(prefix)?;
        chunk_metadata.extend(self.scan_and_cache_metadata(prefix)?);
        Ok(())
    }

    /// Metadata for every table with a live wrapper.
    pub fn get_chunk_metadata_vec(&self, chunk_metadata: &mut ChunkMetadataVec) -> Result<()> {
        let wrappers: Vec<TablePrefix> = self.wrappers.read().unwrap().keys().copied().collect();
        for prefix in wrappers {
            chunk_metadata.extend(self.scan_and_cache_metadata(prefix)?);
        }
        Ok(())
    }

    /// Scan the source through the table's wrapper, then (cache enabled)
    /// persist both the metadata and the wrapper's serialized state.
    pub(crate) fn scan_and_cache_metadata(&self, prefix: TablePrefix) -> Result<ChunkMetadataVec> {
        let wrapper = self.data_wrapper(prefix)?;
        let mut metadata = ChunkMetadataVec::new();
        wrapper.populate_chunk_metadata(&mut metadata)?;
        if let Some(cache) = &self.cache {
            let path = cache
                .get_cache_directory_for_table_prefix(prefix)?
                .join(WRAPPER_METADATA_FILE);
            wrapper.serialize_data_wrapper_internals(&path)?;
            cache.cache_metadata_vec(&metadata)?;
        }
        Ok(metadata)
    }

    pub fn has_data_wrapper(&self, prefix: TablePrefix) -> bool {
        self.wrappers.read().unwrap().contains_key(&prefix)
    }

    pub(crate) fn data_wrapper(&self, prefix: TablePrefix) -> Result<Arc<dyn ForeignDataWrapper>> {
        self.wrappers
            .read()
            .unwrap()
            .get(&prefix)
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no data wrapper for table ({}, {})",
                    prefix.db_id, prefix.table_id
                ))
            })
    }

    /// Double-checked create. Returns `true` when this call constructed the
    /// wrapper.
    pub(crate) fn create_data_wrapper_if_not_exists(&self, prefix: TablePrefix) -> Result<bool> {
        let mut wrappers = self.wrappers.write().unwrap();
        if wrappers.contains_key(&prefix) {
            return Ok(false);
        }
        let table = self.catalog.foreign_table(prefix)?;
        wrappers.insert(prefix, create_data_wrapper(&table));
        Ok(true)
    }

    /// Replace a table's wrapper with a test double, preserving the
    /// original as the double's delegate.
    pub fn set_data_wrapper(
        &self,
        prefix: TablePrefix,
        mock: Arc<MockForeignDataWrapper>,
    ) -> Result<()> {
        let mut wrappers = self.wrappers.write().unwrap();
        let existing = wrappers.get(&prefix).map(Arc::clone).ok_or_else(|| {
            Error::Internal(format!(
                "no data wrapper to replace for table ({}, {})",
                prefix.db_id, prefix.table_id
            ))
        })?;
        mock.set_parent_wrapper(existing);
        wrappers.insert(prefix, mock);
        Ok(())
    }

    /// Rebuild wrapper state from the cache directory: recovered metadata
    /// plus the wrapper's serialized internals. Recovers metadata fully or
    /// not at all before touching the wrapper.
    pub(crate) fn recover_data_wrapper_from_disk(&self, prefix: TablePrefix) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        let mut chunk_metadata = ChunkMetadataVec::new();
        let has_cached_metadata = if cache.has_cached_metadata_for_key_prefix(prefix) {
            cache.get_cached_metadata_vec_for_key_prefix(&mut chunk_metadata, prefix);
            true
        } else {
            cache.recover_cache_for_table(&mut chunk_metadata, prefix)?
        };
        let path = cache
            .get_cache_directory_for_table_prefix(prefix)?
            .join(WRAPPER_METADATA_FILE);
        if has_cached_metadata && path.exists() {
            self.data_wrapper(prefix)?
                .restore_data_wrapper_internals(&path, &chunk_metadata)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn is_data_wrapper_restored(&self, prefix: TablePrefix) -> bool {
        if !self.has_data_wrapper(prefix) {
            return false;
        }
        self.data_wrapper(prefix).is_ok_and(|w| w.is_restored())
    }

    /// Drop everything owned for one table: its wrapper, its cache
    /// partition, and its staging entries.
    pub fn remove_table_related_ds(&self, db_id: i32, table_id: i32) -> Result<()> {
        let prefix = TablePrefix::new(db_id, table_id);
        self.wrappers.write().unwrap().remove(&prefix);
        if let Some(cache) = &self.cache {
            cache.clear_for_table_prefix(prefix)?;
        }
        self.clear_staging_for_table(prefix);
        Ok(())
    }

    /// Range-erase one table's staging entries.
    pub(crate) fn clear_staging_for_table(&self, prefix: TablePrefix) {
        let mut staging = self.staging.lock().unwrap();
        let keys: Vec<ChunkKey> = staging
            .range(prefix.key()..=prefix.upper_bound())
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            staging.remove(&key);
        }
    }

    // This manager is read-only from the buffer manager's perspective.
    // Every write-path entry point is a programming error in the caller.

    pub fn create_buffer(&self, _chunk_key: &ChunkKey) -> Result<BufferHandle> {
        Err(Error::Unsupported("create_buffer on foreign storage".into()))
    }

    pub fn put_buffer(&self, _chunk_key: &ChunkKey, _source: &BufferHandle) -> Result<()> {
        Err(Error::Unsupported("put_buffer on foreign storage".into()))
    }

    pub fn delete_buffer(&self, _chunk_key: &ChunkKey) -> Result<()> {
        Err(Error::Unsupported("delete_buffer on foreign storage".into()))
    }

    pub fn checkpoint(&self) -> Result<()> {
        Err(Error::Unsupported("checkpoint on foreign storage".into()))
    }

    pub fn alloc(&self, _num_bytes: usize) -> Result<BufferHandle> {
        Err(Error::Unsupported("alloc on foreign storage".into()))
    }

    pub fn free(&self, _buffer: BufferHandle) -> Result<()> {
        Err(Error::Unsupported("free on foreign storage".into()))
    }
}
