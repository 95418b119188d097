//! Catalog access trait and the in-memory implementation.
//!
//! The real catalog service lives above this subsystem; the storage layer
//! only needs to resolve a table prefix to its descriptor, enumerate tables
//! due for a scheduled refresh, and record refresh timestamps.
//! [`MemoryCatalog`] is the in-tree implementation used by embedders and
//! tests.

use std::sync::{Arc, RwLock};

use fstore_result::{Error, Result};
use rustc_hash::FxHashMap;

use crate::chunk_key::TablePrefix;
use crate::table::{ForeignTable, RefreshTimingType};

/// Last/next refresh timestamps in epoch seconds; -1 = unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTimes {
    pub last: i64,
    pub next: i64,
}

impl RefreshTimes {
    pub const UNSET: i64 = -1;

    pub fn unset() -> Self {
        Self {
            last: Self::UNSET,
            next: Self::UNSET,
        }
    }
}

pub trait ForeignTableCatalog: Send + Sync {
    /// Resolve a table prefix to its descriptor.
    fn foreign_table(&self, prefix: TablePrefix) -> Result<Arc<ForeignTable>>;

    /// Tables with scheduled timing whose next refresh time has arrived.
    fn scheduled_tables_due(&self, now: i64) -> Vec<Arc<ForeignTable>>;

    fn refresh_times(&self, prefix: TablePrefix) -> Result<RefreshTimes>;

    fn set_refresh_times(&self, prefix: TablePrefix, times: RefreshTimes) -> Result<()>;
}

struct CatalogEntry {
    table: Arc<ForeignTable>,
    times: RefreshTimes,
}

/// Process-local catalog keyed by table prefix.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<FxHashMap<TablePrefix, CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a table. A scheduled table's first refresh is
    /// due at its start time.
    pub fn register_table(&self, table: ForeignTable) -> Arc<ForeignTable> {
        let prefix = table.table_prefix();
        let mut times = RefreshTimes::unset();
        if table.refresh.timing_type == RefreshTimingType::Scheduled
            && let Some(start) = table.refresh.start_time
        {
            times.next = start;
        }
        let table = Arc::new(table);
        let mut tables = self.tables.write().unwrap();
        tables.insert(
            prefix,
            CatalogEntry {
                table: Arc::clone(&table),
                times,
            },
        );
        table
    }

    pub fn drop_table(&self, prefix: TablePrefix) {
        let mut tables = self.tables.write().unwrap();
        tables.remove(&prefix);
    }
}

impl ForeignTableCatalog for MemoryCatalog {
    fn foreign_table(&self, prefix: TablePrefix) -> Result<Arc<ForeignTable>> {
        let tables = self.tables.read().unwrap();
        tables
            .get(&prefix)
            .map(|entry| Arc::clone(&entry.table))
            .ok_or(Error::NotFound)
    }

    fn scheduled_tables_due(&self, now: i64) -> Vec<Arc<ForeignTable>> {
        let tables = self.tables.read().unwrap();
        tables
            .values()
            .filter(|entry| {
                entry.table.refresh.timing_type == RefreshTimingType::Scheduled
                    && entry.times.next != RefreshTimes::UNSET
                    && entry.times.next <= now
            })
            .map(|entry| Arc::clone(&entry.table))
            .collect()
    }

    fn refresh_times(&self, prefix: TablePrefix) -> Result<RefreshTimes> {
        let tables = self.tables.read().unwrap();
        tables
            .get(&prefix)
            .map(|entry| entry.times)
            .ok_or(Error::NotFound)
    }

    fn set_refresh_times(&self, prefix: TablePrefix, times: RefreshTimes) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables.get_mut(&prefix).ok_or(Error::NotFound)?;
        entry.times = times;
        Ok(())
    }
}
