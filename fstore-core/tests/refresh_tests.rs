//! Refresh engine tests: append and full refresh, source mutation
//! detection, the re-population time budget, and refresh command options.

mod common;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{int_table, manager_with_cache, select_ints};
use fstore_core::parse_refresh_options;
use fstore_result::Error;
use fstore_types::{ForeignTableCatalog, MemoryCatalog, RefreshTimes};
use fstore_wrapper::MockForeignDataWrapper;
use tempfile::TempDir;

#[test]
fn append_refresh_keeps_old_fragments_and_adds_new_ones() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(
        2,
        &csv,
        &[("fragment_size", "1"), ("refresh_update_type", "APPEND")],
    ));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);
    let cache = manager.cache().unwrap();
    assert_eq!(cache.cached_chunk_count(), 2);

    // The source grows in place.
    std::fs::write(&csv, "1\n2\n3\n4\n5\n").unwrap();
    let warm_before = cache.get_cached_chunks_for_key_prefix(prefix);
    let adds_before = cache.num_chunks_added();
    manager.refresh_table(prefix, false).unwrap();

    // The refresh itself re-caches exactly one existing chunk: the last
    // fragment, which append mode re-reads.
    assert_eq!(cache.num_chunks_added() - adds_before, 1);

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(cache.cached_chunk_count(), 5);
    // One re-cache plus four chunks new since the refresh began (fragments
    // 1 through 4; fragment 0 was never touched).
    assert_eq!(cache.num_chunks_added() - adds_before, 4);
    for key in warm_before {
        assert!(cache.get_cached_chunk_if_exists(&key).is_some());
    }
}

#[test]
fn append_refresh_rejects_shrunken_source() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("rows.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(
        3,
        &csv,
        &[("fragment_size", "1"), ("refresh_update_type", "APPEND")],
    ));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);

    std::fs::write(&csv, "1\n").unwrap();
    let err = manager.refresh_table(prefix, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Refresh of foreign table created with APPEND update mode failed as file reduced in size: \"rows.csv\"."
    );

    // The cache is untouched; queries keep serving the pre-refresh rows.
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);
}

#[test]
fn append_refresh_rejects_missing_archive_entry() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let archive = source_dir.path().join("archive.zip");

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
    write_archive(&[("a.csv", "1\n"), ("b.csv", "2\n")]);

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(
        4,
        &archive,
        &[("fragment_size", "1"), ("refresh_update_type", "APPEND")],
    ));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);

    write_archive(&[("a.csv", "1\n")]);
    let err = manager.refresh_table(prefix, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Foreign table refreshed with APPEND mode missing archive entry \"b.csv\" from file \"archive.zip\"."
    );
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);
}

#[test]
fn full_refresh_rematerializes_the_warm_set_from_the_new_source() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(5, &csv, &[("fragment_size", "1")]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);
    let cache = manager.cache().unwrap();
    let warm_before = cache.get_cached_chunks_for_key_prefix(prefix);

    std::fs::write(&csv, "7\n8\n9\n").unwrap();
    manager.refresh_table(prefix, false).unwrap();

    // The warm set was re-materialized in place; fragment 2 stays cold
    // until a query asks for it.
    let warm_after = cache.get_cached_chunks_for_key_prefix(prefix);
    assert_eq!(warm_after, warm_before);
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![7, 8, 9]);
}

#[test]
fn evict_refresh_clears_and_lazily_rematerializes() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(6, &csv, &[("fragment_size", "1")]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    select_ints(&manager, &table).unwrap();
    std::fs::write(&csv, "5\n6\n").unwrap();
    manager.refresh_table(prefix, true).unwrap();

    let cache = manager.cache().unwrap();
    assert_eq!(cache.cached_chunk_count(), 0);
    assert_eq!(cache.cached_metadata_count(), 0);
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![5, 6]);
}

#[test]
fn refresh_budget_stops_after_the_running_fragment() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n3\n4\n5\n6\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(7, &csv, &[("fragment_size", "1")]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap().len(), 6);

    // Slow the wrapper down and shrink the budget: the refresh should flush
    // roughly two fragments, then stop without error.
    let mock = Arc::new(MockForeignDataWrapper::new());
    mock.set_populate_delay(Some(Duration::from_millis(300)));
    manager.set_data_wrapper(prefix, Arc::clone(&mock)).unwrap();
    manager.set_refresh_time_budget(Duration::from_millis(500));

    manager.refresh_table(prefix, false).unwrap();
    assert_eq!(mock.populate_calls(), 2);

    // Untouched fragments stay cold but correct.
    mock.set_populate_delay(None);
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn failed_metadata_scan_leaves_the_cache_untouched() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "0\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(8, &csv, &[]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    assert_eq!(select_ints(&manager, &table).unwrap(), vec![0]);

    let mock = Arc::new(MockForeignDataWrapper::new());
    mock.set_fail_metadata_scan(true);
    manager.set_data_wrapper(prefix, Arc::clone(&mock)).unwrap();

    assert!(manager.refresh_table(prefix, false).is_err());
    assert!(mock.metadata_scan_calls() > 0);
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![0]);
}

#[test]
fn wrapper_failure_after_eviction_is_wrapped() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n2\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(9, &csv, &[("fragment_size", "1")]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());

    select_ints(&manager, &table).unwrap();

    let mock = Arc::new(MockForeignDataWrapper::new());
    mock.set_fail_populate(true);
    manager.set_data_wrapper(prefix, Arc::clone(&mock)).unwrap();

    let err = manager.refresh_table(prefix, false).unwrap_err();
    assert!(matches!(err, Error::PostEvictionRefresh(_)));
    assert!(err.to_string().starts_with("Refresh failed after cache eviction:"));

    // Metadata was re-cached before the failure; chunks were not.
    let cache = manager.cache().unwrap();
    assert!(cache.has_cached_metadata_for_key_prefix(prefix));

    // Recovery is user-initiated: the next query materializes on demand.
    mock.set_fail_populate(false);
    assert_eq!(select_ints(&manager, &table).unwrap(), vec![1, 2]);
}

#[test]
fn manual_refresh_stamps_last_refresh_time_only() {
    let source_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let csv = source_dir.path().join("data.csv");
    std::fs::write(&csv, "1\n").unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    let table = catalog.register_table(int_table(10, &csv, &[]));
    let prefix = table.table_prefix();
    let manager = manager_with_cache(&catalog, cache_dir.path());
    select_ints(&manager, &table).unwrap();

    manager.run_refresh(prefix, false, 1_000).unwrap();
    let times = catalog.refresh_times(prefix).unwrap();
    assert_eq!(times.last, 1_000);
    assert_eq!(times.next, RefreshTimes::UNSET);
}

#[test]
fn refresh_option_parsing() {
    let evict = |pairs: &[(&str, &str)]| {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parse_refresh_options(&map)
    };

    assert!(!evict(&[]).unwrap());
    assert!(evict(&[("evict", "true")]).unwrap());
    assert!(!evict(&[("EVICT", "false")]).unwrap());

    assert_eq!(
        evict(&[("evict", "invalid")]).unwrap_err().to_string(),
        "Invalid value \"invalid\" provided for EVICT option. Value must be either \"true\" or \"false\"."
    );
    assert_eq!(
        evict(&[("invalid_key", "false")]).unwrap_err().to_string(),
        "Invalid option \"INVALID_KEY\" provided for refresh command. Only \"EVICT\" option is supported."
    );
}
