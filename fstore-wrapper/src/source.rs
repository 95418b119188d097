//! Source enumeration for delimited-text wrappers: plain files, directories
//! (recursive), and zip archives, in deterministic order.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fstore_result::{Error, Result};
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

/// Extensions accepted for delimited text data.
const DATA_EXTENSIONS: &[&str] = &["csv", "tsv"];

/// Where one stretch of source bytes lives. Archive entry offsets are
/// within the decompressed entry stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocation {
    File { path: String },
    ArchiveEntry { archive: String, entry: String },
}

impl SourceLocation {
    /// File name component used in user-visible source mutation errors.
    pub fn display_name(&self) -> String {
        match self {
            SourceLocation::File { path } => file_name(Path::new(path)),
            SourceLocation::ArchiveEntry { entry, .. } => file_name(Path::new(entry)),
        }
    }
}

/// One enumerated source with its size at enumeration time (decompressed
/// size for archive entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub location: SourceLocation,
    pub size: u64,
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn is_data_extension(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| DATA_EXTENSIONS.contains(&e.as_str()))
}

fn invalid_extension(path: &Path) -> Error {
    Error::SourceInvalid(format!("Invalid extention for file \"{}\".", path.display()))
}

/// Enumerate the sources of a delimited table rooted at `root`: a single
/// `.csv`/`.tsv` file, a `.zip` archive, or a directory of either
/// (recursive, sorted). Any file with another extension is an error.
pub fn enumerate_sources(root: &Path) -> Result<Vec<SourceFile>> {
    if !root.exists() {
        return Err(Error::SourceInvalid(format!(
            "File or directory \"{}\" does not exist.",
            root.display()
        )));
    }
    if root.is_dir() {
        let mut files = Vec::new();
        collect_dir_files(root, &mut files)?;
        files.sort();
        let mut sources = Vec::new();
        for file in files {
            sources.extend(enumerate_file(&file)?);
        }
        return Ok(sources);
    }
    enumerate_file(root)
}

fn collect_dir_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = file_name(&path);
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_dir_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn enumerate_file(path: &Path) -> Result<Vec<SourceFile>> {
    if extension_of(path).as_deref() == Some("zip") {
        return enumerate_archive(path);
    }
    if !is_data_extension(path) {
        return Err(invalid_extension(path));
    }
    let size = std::fs::metadata(path)?.len();
    Ok(vec![SourceFile {
        location: SourceLocation::File {
            path: path.to_string_lossy().into_owned(),
        },
        size,
    }])
}

fn enumerate_archive(path: &Path) -> Result<Vec<SourceFile>> {
    let file = File::open(path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| Error::SourceInvalid(err.to_string()))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| Error::SourceInvalid(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if file_name(Path::new(&name)).starts_with('.') {
            continue;
        }
        if !is_data_extension(Path::new(&name)) {
            return Err(invalid_extension(Path::new(&name)));
        }
        entries.push((name, entry.size()));
    }
    entries.sort();
    Ok(entries
        .into_iter()
        .map(|(entry, size)| SourceFile {
            location: SourceLocation::ArchiveEntry {
                archive: path.to_string_lossy().into_owned(),
                entry,
            },
            size,
        })
        .collect())
}

/// Open a source positioned at `offset` bytes into its (decompressed)
/// stream.
pub fn open_source_at(location: &SourceLocation, offset: u64) -> Result<Box<dyn Read + Send>> {
    match location {
        SourceLocation::File { path } => {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            Ok(Box::new(file))
        }
        SourceLocation::ArchiveEntry { archive, entry } => {
            let bytes = read_archive_entry(Path::new(archive), entry)?;
            let mut cursor = Cursor::new(bytes);
            cursor.set_position(offset);
            Ok(Box::new(cursor))
        }
    }
}

fn read_archive_entry(archive_path: &Path, entry: &str) -> Result<Vec<u8>> {
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| Error::SourceInvalid(err.to_string()))?;
    let mut zipped = archive.by_name(entry).map_err(|_| Error::SourceInvalid(format!(
        "File \"{entry}\" does not exist in archive \"{}\".",
        file_name(archive_path)
    )))?;
    let mut bytes = Vec::with_capacity(zipped.size() as usize);
    zipped.read_to_end(&mut bytes)?;
    Ok(bytes)
}
