//! The chunk buffer primitive.
//!
//! A [`ChunkBuffer`] is an opaque, ref-counted byte region with a dirty flag.
//! Wrappers append into buffers handed out by the cache (or the staging
//! map); the storage manager copies between buffers with
//! [`ChunkBuffer::copy_to`]. Interior mutability keeps handles shareable
//! across the cache, the staging map, and in-flight fetches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use fstore_result::{Error, Result};

/// Shared handle to a chunk buffer. The last holder drops the bytes.
pub type BufferHandle = Arc<ChunkBuffer>;

#[derive(Debug, Default)]
pub struct ChunkBuffer {
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

impl ChunkBuffer {
    /// Empty, clean buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer pre-filled with `bytes`, clean. Used when loading a cached
    /// chunk back from disk.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(bytes),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn handle() -> BufferHandle {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, e.g. after the buffer contents were made
    /// durable.
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Replace the buffer contents. Marks the buffer dirty.
    pub fn write(&self, bytes: &[u8]) {
        let mut data = self.data.write().unwrap();
        data.clear();
        data.extend_from_slice(bytes);
        self.dirty.store(true, Ordering::Release);
    }

    /// Append to the buffer contents. Marks the buffer dirty.
    pub fn append(&self, bytes: &[u8]) {
        let mut data = self.data.write().unwrap();
        data.extend_from_slice(bytes);
        self.dirty.store(true, Ordering::Release);
    }

    /// Copy `num_bytes` from this buffer into `dst` (`0` = the entire
    /// buffer). `dst` is fully written or unchanged.
    pub fn copy_to(&self, dst: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        let data = self.data.read().unwrap();
        let n = if num_bytes == 0 { data.len() } else { num_bytes };
        if n > data.len() {
            return Err(Error::Internal(format!(
                "chunk buffer copy of {n} bytes exceeds source size {}",
                data.len()
            )));
        }
        dst.write(&data[..n]);
        Ok(())
    }

    /// Snapshot of the buffer contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_marks_dirty_and_copy_delivers_bytes() {
        let src = ChunkBuffer::new();
        assert!(!src.is_dirty());
        src.append(&[1, 2, 3, 4]);
        assert!(src.is_dirty());

        let dst = ChunkBuffer::new();
        src.copy_to(&dst, 0).unwrap();
        assert_eq!(dst.to_vec(), vec![1, 2, 3, 4]);

        let partial = ChunkBuffer::new();
        src.copy_to(&partial, 2).unwrap();
        assert_eq!(partial.to_vec(), vec![1, 2]);

        assert!(src.copy_to(&ChunkBuffer::new(), 5).is_err());
    }
}
