//! On-disk layout helpers: table directories, chunk files, and the
//! metadata log.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use fstore_result::{Error, Result};
use fstore_types::{ChunkKey, ChunkMetadataVec, TablePrefix};

pub const CHUNKS_DIR: &str = "chunks";
pub const METADATA_LOG: &str = "metadata.log";

pub fn table_dir(base: &Path, prefix: TablePrefix) -> PathBuf {
    base.join(format!("{}_{}", prefix.db_id, prefix.table_id))
}

pub fn chunks_dir(base: &Path, prefix: TablePrefix) -> PathBuf {
    table_dir(base, prefix).join(CHUNKS_DIR)
}

pub fn metadata_log_path(base: &Path, prefix: TablePrefix) -> PathBuf {
    table_dir(base, prefix).join(METADATA_LOG)
}

/// File name for the non-table part of a chunk key.
pub fn chunk_file_name(key: &ChunkKey) -> String {
    match key.varlen_subkey() {
        Some(subkey) => format!("{}_{}_{}", key.column_id(), key.fragment_id(), subkey),
        None => format!("{}_{}", key.column_id(), key.fragment_id()),
    }
}

/// Inverse of [`chunk_file_name`]; `None` for foreign files in the chunks
/// directory.
pub fn parse_chunk_file_name(prefix: TablePrefix, name: &str) -> Option<ChunkKey> {
    let mut parts = Vec::with_capacity(5);
    parts.push(prefix.db_id);
    parts.push(prefix.table_id);
    for piece in name.split('_') {
        parts.push(piece.parse().ok()?);
    }
    if parts.len() < 4 || parts.len() > 5 {
        return None;
    }
    let key = ChunkKey::new(parts);
    key.validate().ok()?;
    Some(key)
}

/// Write chunk bytes durably: temp file in the same directory, then rename.
pub fn write_chunk_file(base: &Path, key: &ChunkKey, bytes: &[u8]) -> Result<()> {
    let dir = chunks_dir(base, key.table_prefix());
    fs::create_dir_all(&dir)?;
    let name = chunk_file_name(key);
    let tmp = dir.join(format!(".{name}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

pub fn read_chunk_file(base: &Path, key: &ChunkKey) -> Result<Vec<u8>> {
    let path = chunks_dir(base, key.table_prefix()).join(chunk_file_name(key));
    Ok(fs::read(path)?)
}

/// Chunk keys recoverable from the chunks directory, if it exists.
pub fn list_chunk_files(base: &Path, prefix: TablePrefix) -> Result<Vec<ChunkKey>> {
    let dir = chunks_dir(base, prefix);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(key) = parse_chunk_file_name(prefix, name) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Append one metadata batch to the table's log as a length-prefixed
/// bitcode frame. One frame per `cache_metadata_vec` call gives the
/// all-or-none visibility the recovery path relies on.
pub fn append_metadata_frame(base: &Path, prefix: TablePrefix, batch: &ChunkMetadataVec) -> Result<()> {
    let dir = table_dir(base, prefix);
    fs::create_dir_all(&dir)?;
    let encoded = bitcode::encode(batch);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(METADATA_LOG))?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| Error::Internal("metadata log frame exceeds 4 GiB".into()))?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(&encoded)?;
    file.sync_data()?;
    Ok(())
}

/// Replay the metadata log. Later frames overwrite earlier entries; a torn
/// final frame (crash mid-append) is dropped with a warning.
pub fn replay_metadata_log(base: &Path, prefix: TablePrefix) -> Result<ChunkMetadataVec> {
    let path = metadata_log_path(base, prefix);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut entries: std::collections::BTreeMap<ChunkKey, _> = std::collections::BTreeMap::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > bytes.len() {
            tracing::warn!(path = %path.display(), "dropping torn final metadata log frame");
            break;
        }
        match bitcode::decode::<ChunkMetadataVec>(&bytes[pos..pos + len]) {
            Ok(batch) => {
                for (key, meta) in batch {
                    entries.insert(key, meta);
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "stopping metadata log replay at undecodable frame");
                break;
            }
        }
        pos += len;
    }
    Ok(entries.into_iter().collect())
}
