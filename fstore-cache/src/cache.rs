//! The foreign storage cache proper.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use fstore_result::{Error, Result};
use fstore_types::{BufferHandle, ChunkBuffer, ChunkKey, ChunkMetadata, ChunkMetadataVec, TablePrefix};

use crate::disk;

/// Persistent, table-partitioned store of chunk buffers and chunk
/// metadata.
///
/// Buffers handed out by [`get_chunk_buffers_for_caching`] are tentative:
/// they are invisible to readers until [`cache_table_chunks`] promotes
/// them, at which point the bytes are also written durably. Readers treat
/// every operation here as atomic; internal locks are private.
///
/// [`get_chunk_buffers_for_caching`]: ForeignStorageCache::get_chunk_buffers_for_caching
/// [`cache_table_chunks`]: ForeignStorageCache::cache_table_chunks
pub struct ForeignStorageCache {
    base_path: PathBuf,
    /// Promoted chunks, visible to readers.
    chunks: RwLock<BTreeMap<ChunkKey, BufferHandle>>,
    /// Buffers handed out for population, not yet promoted.
    pending: Mutex<BTreeMap<ChunkKey, BufferHandle>>,
    /// Chunks recovered from disk but not yet loaded into memory.
    on_disk: RwLock<BTreeSet<ChunkKey>>,
    metadata: RwLock<BTreeMap<ChunkKey, ChunkMetadata>>,
    num_chunks_added: AtomicU64,
    num_metadata_added: AtomicU64,
}

impl ForeignStorageCache {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            chunks: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            on_disk: RwLock::new(BTreeSet::new()),
            metadata: RwLock::new(BTreeMap::new()),
            num_chunks_added: AtomicU64::new(0),
            num_metadata_added: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Empty buffers for the given keys, pre-registered for later
    /// promotion. The wrapper writes into these; until
    /// [`cache_table_chunks`](Self::cache_table_chunks) runs, readers keep
    /// seeing whatever was promoted before.
    pub fn get_chunk_buffers_for_caching(
        &self,
        keys: &[ChunkKey],
    ) -> Result<BTreeMap<ChunkKey, BufferHandle>> {
        let mut out = BTreeMap::new();
        let mut pending = self.pending.lock().unwrap();
        for key in keys {
            key.validate()?;
            let buffer = ChunkBuffer::handle();
            pending.insert(key.clone(), BufferHandle::clone(&buffer));
            out.insert(key.clone(), buffer);
        }
        Ok(out)
    }

    /// Promote previously handed-out buffers to durable cached chunks.
    /// Metadata for every promoted key must already be cached.
    pub fn cache_table_chunks(&self, keys: &[ChunkKey]) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        for key in keys {
            let buffer = pending.remove(key).ok_or_else(|| {
                Error::Internal(format!(
                    "chunk key {:?} was not registered for caching",
                    key.parts()
                ))
            })?;
            if !self.is_metadata_cached(&key.metadata_key()) {
                return Err(Error::Internal(format!(
                    "caching chunk {:?} without cached metadata",
                    key.parts()
                )));
            }
            disk::write_chunk_file(&self.base_path, key, &buffer.to_vec())?;
            buffer.mark_clean();
            self.chunks.write().unwrap().insert(key.clone(), buffer);
            self.on_disk.write().unwrap().remove(key);
            self.num_chunks_added.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// A present result is guaranteed to have matching cached metadata.
    /// Recovered chunks load lazily from disk on first access.
    pub fn get_cached_chunk_if_exists(&self, key: &ChunkKey) -> Option<BufferHandle> {
        if let Some(buffer) = self.chunks.read().unwrap().get(key) {
            return Some(BufferHandle::clone(buffer));
        }
        if !self.on_disk.read().unwrap().contains(key) {
            return None;
        }
        match disk::read_chunk_file(&self.base_path, key) {
            Ok(bytes) => {
                let buffer = BufferHandle::new(ChunkBuffer::from_bytes(bytes));
                self.chunks
                    .write()
                    .unwrap()
                    .insert(key.clone(), BufferHandle::clone(&buffer));
                self.on_disk.write().unwrap().remove(key);
                Some(buffer)
            }
            Err(err) => {
                tracing::warn!(key = ?key.parts(), %err, "failed to load recovered chunk file");
                self.on_disk.write().unwrap().remove(key);
                None
            }
        }
    }

    pub fn is_metadata_cached(&self, key: &ChunkKey) -> bool {
        self.metadata.read().unwrap().contains_key(key)
    }

    pub fn has_cached_metadata_for_key_prefix(&self, prefix: TablePrefix) -> bool {
        let metadata = self.metadata.read().unwrap();
        metadata
            .range(prefix.key()..=prefix.upper_bound())
            .next()
            .is_some()
    }

    pub fn get_cached_metadata_vec_for_key_prefix(
        &self,
        out: &mut ChunkMetadataVec,
        prefix: TablePrefix,
    ) {
        let metadata = self.metadata.read().unwrap();
        for (key, meta) in metadata.range(prefix.key()..=prefix.upper_bound()) {
            out.push((key.clone(), *meta));
        }
    }

    /// Cache a metadata batch. Atomic per call: one write-lock section plus
    /// one appended log frame, so concurrent readers see all of the batch
    /// or none of it.
    pub fn cache_metadata_vec(&self, vec: &ChunkMetadataVec) -> Result<()> {
        if vec.is_empty() {
            return Ok(());
        }
        let mut by_table: BTreeMap<TablePrefix, ChunkMetadataVec> = BTreeMap::new();
        for (key, meta) in vec {
            key.validate()?;
            by_table
                .entry(key.table_prefix())
                .or_default()
                .push((key.clone(), *meta));
        }
        let mut metadata = self.metadata.write().unwrap();
        for (prefix, batch) in &by_table {
            disk::append_metadata_frame(&self.base_path, *prefix, batch)?;
            for (key, meta) in batch {
                metadata.insert(key.clone(), *meta);
                self.num_metadata_added.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Currently cached chunk keys for a table: the warm set a refresh
    /// re-materializes. Includes recovered chunks not yet loaded.
    pub fn get_cached_chunks_for_key_prefix(&self, prefix: TablePrefix) -> Vec<ChunkKey> {
        let chunks = self.chunks.read().unwrap();
        let on_disk = self.on_disk.read().unwrap();
        let mut keys: BTreeSet<ChunkKey> = chunks
            .range(prefix.key()..=prefix.upper_bound())
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            on_disk
                .range(prefix.key()..=prefix.upper_bound())
                .cloned(),
        );
        keys.into_iter().collect()
    }

    /// Remove all chunks, metadata, pending buffers, and on-disk state for
    /// a table. No-op when the table was never cached.
    pub fn clear_for_table_prefix(&self, prefix: TablePrefix) -> Result<()> {
        let range = prefix.key()..=prefix.upper_bound();
        {
            let mut chunks = self.chunks.write().unwrap();
            let keys: Vec<ChunkKey> = chunks.range(range.clone()).map(|(k, _)| k.clone()).collect();
            for key in keys {
                chunks.remove(&key);
            }
        }
        {
            let mut pending = self.pending.lock().unwrap();
            let keys: Vec<ChunkKey> = pending.range(range.clone()).map(|(k, _)| k.clone()).collect();
            for key in keys {
                pending.remove(&key);
            }
        }
        {
            let mut on_disk = self.on_disk.write().unwrap();
            let keys: Vec<ChunkKey> = on_disk.range(range.clone()).cloned().collect();
            for key in keys {
                on_disk.remove(&key);
            }
        }
        {
            let mut metadata = self.metadata.write().unwrap();
            let keys: Vec<ChunkKey> = metadata.range(range).map(|(k, _)| k.clone()).collect();
            for key in keys {
                metadata.remove(&key);
            }
        }
        let dir = disk::table_dir(&self.base_path, prefix);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Recover a table's cache state from disk. Returns `true` and fills
    /// `out` when metadata was recovered; chunk files are indexed for lazy
    /// loading. Metadata recovers even when the wrapper's serialized state
    /// is absent.
    pub fn recover_cache_for_table(
        &self,
        out: &mut ChunkMetadataVec,
        prefix: TablePrefix,
    ) -> Result<bool> {
        let recovered = disk::replay_metadata_log(&self.base_path, prefix)?;
        if recovered.is_empty() {
            return Ok(false);
        }
        {
            let mut metadata = self.metadata.write().unwrap();
            for (key, meta) in &recovered {
                metadata.insert(key.clone(), *meta);
            }
        }
        let chunk_keys = disk::list_chunk_files(&self.base_path, prefix)?;
        {
            let metadata = self.metadata.read().unwrap();
            let mut on_disk = self.on_disk.write().unwrap();
            for key in chunk_keys {
                // Only surface chunks whose metadata survived; anything else
                // is an orphan from a torn write.
                if metadata.contains_key(&key.metadata_key()) {
                    on_disk.insert(key);
                }
            }
        }
        tracing::debug!(
            db_id = prefix.db_id,
            table_id = prefix.table_id,
            entries = recovered.len(),
            "recovered cached metadata for table"
        );
        out.extend(recovered);
        Ok(true)
    }

    /// Directory the wrapper uses for its serialized state.
    pub fn get_cache_directory_for_table_prefix(&self, prefix: TablePrefix) -> Result<PathBuf> {
        let dir = disk::table_dir(&self.base_path, prefix);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn cached_chunk_count(&self) -> usize {
        self.chunks.read().unwrap().len() + self.on_disk.read().unwrap().len()
    }

    pub fn cached_metadata_count(&self) -> usize {
        self.metadata.read().unwrap().len()
    }

    /// Total chunk promotions since the cache was opened.
    pub fn num_chunks_added(&self) -> u64 {
        self.num_chunks_added.load(Ordering::Acquire)
    }

    /// Total metadata entries cached since the cache was opened.
    pub fn num_metadata_added(&self) -> u64 {
        self.num_metadata_added.load(Ordering::Acquire)
    }
}
