//! Manual and scheduled refresh over the cache and wrappers.
//!
//! A non-evicting refresh re-scans the source metadata, then re-populates
//! the warm set fragment by fragment under a wall-clock budget. Fragments
//! left cold when the budget runs out stay correct: on-demand fetches
//! materialize them later.

use std::collections::HashMap;
use std::time::Instant;

use fstore_cache::ForeignStorageCache;
use fstore_result::{Error, Result};
use fstore_types::{
    ChunkKey, ChunkMetadataVec, RefreshTimes, RefreshTimingType, TablePrefix,
};
use fstore_wrapper::{ChunkBufferMap, WRAPPER_METADATA_FILE};

use crate::manager::ForeignStorageMgr;

/// Parse `REFRESH FOREIGN TABLES ... WITH (...)` options. Returns the
/// evict flag.
pub fn parse_refresh_options(options: &HashMap<String, String>) -> Result<bool> {
    let mut evict = false;
    for (key, value) in options {
        if !key.eq_ignore_ascii_case("evict") {
            return Err(Error::BadOption(format!(
                "Invalid option \"{}\" provided for refresh command. Only \"EVICT\" option is supported.",
                key.to_ascii_uppercase()
            )));
        }
        evict = match value.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(Error::BadOption(format!(
                    "Invalid value \"{value}\" provided for EVICT option. Value must be either \"true\" or \"false\"."
                )));
            }
        };
    }
    Ok(evict)
}

impl ForeignStorageMgr {
    /// Refresh one table. Always drops its staging entries first; with
    /// `evict` the cache partition is simply cleared and the next query
    /// re-materializes from source.
    pub fn refresh_table(&self, prefix: TablePrefix, evict_cached_entries: bool) -> Result<()> {
        self.clear_staging_for_table(prefix);
        if evict_cached_entries {
            self.evict_table_from_cache(prefix)
        } else {
            self.refresh_table_in_cache(prefix)
        }
    }

    /// Manual refresh entry point: refresh, then stamp the table's refresh
    /// times.
    pub fn run_refresh(&self, prefix: TablePrefix, evict: bool, now: i64) -> Result<()> {
        self.refresh_table(prefix, evict)?;
        self.stamp_refresh_times(prefix, now)
    }

    /// Record a refresh at `now`: `last = now`, and for scheduled tables
    /// `next = now + interval` (unset without an interval).
    pub(crate) fn stamp_refresh_times(&self, prefix: TablePrefix, now: i64) -> Result<()> {
        let table = self.catalog.foreign_table(prefix)?;
        let next = if table.refresh.timing_type == RefreshTimingType::Scheduled {
            table
                .refresh
                .interval
                .map(|interval| now + interval.as_seconds())
                .unwrap_or(RefreshTimes::UNSET)
        } else {
            RefreshTimes::UNSET
        };
        self.catalog.set_refresh_times(prefix, RefreshTimes { last: now, next })
    }

    fn evict_table_from_cache(&self, prefix: TablePrefix) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear_for_table_prefix(prefix)?;
        }
        Ok(())
    }

    /// The non-evicting refresh protocol.
    ///
    /// Order matters: the metadata re-scan (which also performs append-mode
    /// source validation) runs before anything is cleared, so a failing
    /// scan leaves the cache exactly as it was. Once the cache has been
    /// mutated, wrapper failures are wrapped as post-eviction errors.
    fn refresh_table_in_cache(&self, prefix: TablePrefix) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let table = self.catalog.foreign_table(prefix)?;
        let append_mode = table.is_append_mode();

        if self.create_data_wrapper_if_not_exists(prefix)? && append_mode {
            // Restore how far the wrapper had previously read.
            self.recover_data_wrapper_from_disk(prefix)?;
        }

        // Snapshot the warm set, ordered by fragment so the re-population
        // below flushes whole fragments.
        let mut old_chunk_keys = cache.get_cached_chunks_for_key_prefix(prefix);
        old_chunk_keys.sort_by_key(|key| {
            (key.fragment_id(), key.column_id(), key.varlen_subkey().unwrap_or(0))
        });

        let wrapper = self.data_wrapper(prefix)?;
        let mut metadata_vec = ChunkMetadataVec::new();
        wrapper.populate_chunk_metadata(&mut metadata_vec)?;
        wrapper.serialize_data_wrapper_internals(
            &cache
                .get_cache_directory_for_table_prefix(prefix)?
                .join(WRAPPER_METADATA_FILE),
        )?;

        let mut last_frag_id = 0;
        if append_mode {
            if cache.has_cached_metadata_for_key_prefix(prefix) {
                let mut cached_metadata = ChunkMetadataVec::new();
                cache.get_cached_metadata_vec_for_key_prefix(&mut cached_metadata, prefix);
                for (key, _) in &cached_metadata {
                    last_frag_id = last_frag_id.max(key.fragment_id());
                }
            }
        } else {
            cache.clear_for_table_prefix(prefix)?;
        }

        self.repopulate_warm_chunks(
            cache,
            prefix,
            append_mode,
            last_frag_id,
            &metadata_vec,
            &old_chunk_keys,
        )
        .map_err(Error::post_eviction_refresh)
    }

    /// Re-cache metadata, then re-populate previously-cached chunks one
    /// fragment at a time, stopping cleanly when the time budget runs out.
    fn repopulate_warm_chunks(
        &self,
        cache: &ForeignStorageCache,
        prefix: TablePrefix,
        append_mode: bool,
        last_frag_id: i32,
        metadata_vec: &ChunkMetadataVec,
        old_chunk_keys: &[ChunkKey],
    ) -> Result<()> {
        if append_mode {
            // Only the last fragment and above get fresh metadata; entries
            // below it are immutable under the append contract.
            let new_metadata: ChunkMetadataVec = metadata_vec
                .iter()
                .filter(|(key, _)| key.fragment_id() >= last_frag_id)
                .cloned()
                .collect();
            cache.cache_metadata_vec(&new_metadata)?;
        } else {
            cache.cache_metadata_vec(metadata_vec)?;
        }

        if old_chunk_keys.is_empty() {
            return Ok(());
        }
        let wrapper = self.data_wrapper(prefix)?;
        let budget = *self.refresh_time_budget.lock().unwrap();
        let start_time = Instant::now();
        let optional_buffers = ChunkBufferMap::new();

        let mut chunk_keys_to_be_cached = Vec::new();
        let mut chunk_keys_in_fragment = Vec::new();
        let mut fragment_id = old_chunk_keys[0].fragment_id();
        for chunk_key in old_chunk_keys {
            if append_mode && chunk_key.fragment_id() < last_frag_id {
                continue;
            }
            // Exact-key check: varlen index keys carry no metadata entry of
            // their own and are batched alongside their data sibling below.
            // Keys dropped by the new source state are skipped too, so the
            // warm set never grows past the fresh metadata.
            if !cache.is_metadata_cached(chunk_key) {
                continue;
            }
            if chunk_key.fragment_id() != fragment_id {
                if !chunk_keys_in_fragment.is_empty() {
                    let required = cache.get_chunk_buffers_for_caching(&chunk_keys_in_fragment)?;
                    wrapper.populate_chunk_buffers(&required, &optional_buffers)?;
                    chunk_keys_in_fragment.clear();
                }
                if start_time.elapsed() >= budget {
                    tracing::warn!(
                        db_id = prefix.db_id,
                        table_id = prefix.table_id,
                        fragment_id,
                        "refresh time budget exceeded; remaining fragments stay cold"
                    );
                    break;
                }
                fragment_id = chunk_key.fragment_id();
            }
            if chunk_key.is_varlen_key() {
                // The warm set lists data keys; the wrapper populates the
                // paired index buffer in the same pass.
                let index_chunk_key = chunk_key.sibling_index_key()?;
                chunk_keys_in_fragment.push(index_chunk_key.clone());
                chunk_keys_to_be_cached.push(index_chunk_key);
            }
            chunk_keys_in_fragment.push(chunk_key.clone());
            chunk_keys_to_be_cached.push(chunk_key.clone());
        }
        if !chunk_keys_in_fragment.is_empty() {
            let required = cache.get_chunk_buffers_for_caching(&chunk_keys_in_fragment)?;
            wrapper.populate_chunk_buffers(&required, &optional_buffers)?;
        }
        cache.cache_table_chunks(&chunk_keys_to_be_cached)?;
        Ok(())
    }
}
