//! Test double that wraps a real data wrapper.
//!
//! Installed over an existing wrapper via the storage manager; delegates
//! every call to its parent unless a failure or delay knob is set. Call
//! counters let tests assert whether a wrapper was exercised at all.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fstore_result::{Error, Result};
use fstore_types::ChunkMetadataVec;

use crate::{ChunkBufferMap, ForeignDataWrapper};

#[derive(Default)]
pub struct MockForeignDataWrapper {
    parent: RwLock<Option<Arc<dyn ForeignDataWrapper>>>,
    fail_metadata_scan: AtomicBool,
    fail_populate: AtomicBool,
    populate_delay: Mutex<Option<Duration>>,
    metadata_scan_calls: AtomicUsize,
    populate_calls: AtomicUsize,
}

impl MockForeignDataWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapper this double delegates to. Set by the storage manager
    /// when the mock is installed over an existing entry.
    pub fn set_parent_wrapper(&self, parent: Arc<dyn ForeignDataWrapper>) {
        *self.parent.write().unwrap() = Some(parent);
    }

    pub fn set_fail_metadata_scan(&self, fail: bool) {
        self.fail_metadata_scan.store(fail, Ordering::Release);
    }

    pub fn set_fail_populate(&self, fail: bool) {
        self.fail_populate.store(fail, Ordering::Release);
    }

    /// Sleep this long on every `populate_chunk_buffers` call.
    pub fn set_populate_delay(&self, delay: Option<Duration>) {
        *self.populate_delay.lock().unwrap() = delay;
    }

    pub fn metadata_scan_calls(&self) -> usize {
        self.metadata_scan_calls.load(Ordering::Acquire)
    }

    pub fn populate_calls(&self) -> usize {
        self.populate_calls.load(Ordering::Acquire)
    }

    fn parent(&self) -> Result<Arc<dyn ForeignDataWrapper>> {
        self.parent
            .read()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Internal("mock data wrapper has no parent".into()))
    }
}

impl ForeignDataWrapper for MockForeignDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVec) -> Result<()> {
        self.metadata_scan_calls.fetch_add(1, Ordering::AcqRel);
        if self.fail_metadata_scan.load(Ordering::Acquire) {
            return Err(Error::SourceInvalid(
                "Mock data wrapper metadata scan failure.".into(),
            ));
        }
        self.parent()?.populate_chunk_metadata(out)
    }

    fn populate_chunk_buffers(
        &self,
        required: &ChunkBufferMap,
        optional: &ChunkBufferMap,
    ) -> Result<()> {
        self.populate_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = *self.populate_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        if self.fail_populate.load(Ordering::Acquire) {
            return Err(Error::SourceInvalid(
                "Mock data wrapper buffer population failure.".into(),
            ));
        }
        self.parent()?.populate_chunk_buffers(required, optional)
    }

    fn serialize_data_wrapper_internals(&self, path: &Path) -> Result<()> {
        self.parent()?.serialize_data_wrapper_internals(path)
    }

    fn restore_data_wrapper_internals(
        &self,
        path: &Path,
        cached_metadata: &ChunkMetadataVec,
    ) -> Result<()> {
        self.parent()?.restore_data_wrapper_internals(path, cached_metadata)
    }

    fn is_restored(&self) -> bool {
        self.parent
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|p| p.is_restored())
    }
}
