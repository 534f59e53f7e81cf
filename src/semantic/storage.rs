//! On-disk layout for one embedding space.
//!
//! ```text
//! <root>/<space id>/
//!     CURRENT              manifest naming the committed generation
//!     index.<gen>.bin      flat vector index
//!     meta.<gen>.json      metadata records, same order as the index
//!     .lock                writer lock
//! ```
//!
//! File format: index.<gen>.bin
//!
//! Header (21 bytes):
//! - magic: [u8; 4] ("KBVI")
//! - version: u8 (1)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body:
//! - vectors: [f32; dimensions * entry_count] (little-endian)
//! - payload checksum: u32 (CRC32 of the vector bytes)
//!
//! A commit writes both generation files first and only then swaps
//! `CURRENT`, so readers either see the old pair or the new pair.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::CorpusLock;
use crate::semantic::corpus::{Corpus, CorpusError};
use crate::semantic::index::VectorIndex;
use crate::semantic::metadata::MetadataStore;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

const MAGIC: &[u8; 4] = b"KBVI";

/// Header size in bytes: magic(4) + version(1) + dimensions(4) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 21;

const MANIFEST_FILE: &str = "CURRENT";

/// Attempts at reading a consistent generation while writers are committing
const LOAD_ATTEMPTS: usize = 3;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to read corpus: {0}")]
    Read(std::io::Error),

    #[error("failed to write corpus: {0}")]
    Write(std::io::Error),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: {0} may be corrupted")]
    ChecksumMismatch(String),

    #[error("corrupt corpus: {0}")]
    Corrupt(String),

    #[error("failed to encode corpus metadata: {0}")]
    Encode(serde_json::Error),
}

impl From<CorpusError> for StorageError {
    fn from(err: CorpusError) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// Describes the committed generation of a corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub entries: usize,
    pub dimensions: usize,
    pub committed_at: DateTime<Utc>,
}

/// Storage manager for one embedding space.
pub struct CorpusStorage {
    dir: PathBuf,
}

impl CorpusStorage {
    /// Storage for `space_id` under the corpus root.
    pub fn new(root: &Path, space_id: &str) -> Self {
        Self {
            dir: root.join(space_id),
        }
    }

    /// Directory holding this space's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the exclusive writer lock, waiting for other writers.
    pub fn lock(&self) -> Result<CorpusLock, StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(StorageError::Write)?;

        match CorpusLock::try_acquire(&self.dir) {
            Ok(lock) => Ok(lock),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                log::info!("corpus {} is being written, waiting", self.dir.display());
                CorpusLock::acquire_blocking(&self.dir).map_err(StorageError::Write)
            }
            Err(err) => Err(StorageError::Write(err)),
        }
    }

    /// Read the manifest, `None` when nothing has been committed yet.
    pub fn read_manifest(&self) -> Result<Option<Manifest>, StorageError> {
        let bytes = match std::fs::read(self.dir.join(MANIFEST_FILE)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::Read(err)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("unreadable manifest: {e}")))
    }

    /// Load the committed corpus, `None` when nothing has been committed yet.
    pub fn load(&self) -> Result<Option<(Manifest, Corpus)>, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(manifest) = self.read_manifest()? else {
                return Ok(None);
            };

            match self.load_generation(&manifest) {
                Ok(corpus) => return Ok(Some((manifest, corpus))),
                Err(err) if attempt < LOAD_ATTEMPTS && self.generation_moved(&manifest) => {
                    log::debug!("generation {} replaced while loading: {err}", manifest.generation);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Load the files of one generation and check them against the manifest.
    pub fn load_generation(&self, manifest: &Manifest) -> Result<Corpus, StorageError> {
        let index = self.read_index(&self.index_path(manifest.generation))?;

        let meta_path = self.meta_path(manifest.generation);
        let meta_bytes = std::fs::read(&meta_path).map_err(|err| missing_is_corrupt(err, &meta_path))?;
        let metadata = MetadataStore::from_json(&meta_bytes)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", meta_path.display())))?;

        if index.dimensions() != manifest.dimensions {
            return Err(StorageError::Corrupt(format!(
                "manifest says {} dimensions, index has {}",
                manifest.dimensions,
                index.dimensions()
            )));
        }
        if index.len() != manifest.entries || metadata.len() != manifest.entries {
            return Err(StorageError::Corrupt(format!(
                "manifest says {} entries, index has {}, metadata has {}",
                manifest.entries,
                index.len(),
                metadata.len()
            )));
        }

        Ok(Corpus::from_parts(index, metadata)?)
    }

    /// Persist `corpus` as the generation after `previous`.
    ///
    /// Uses atomic writes: temp file -> fsync -> rename, for both data files
    /// and then for the manifest.
    pub fn commit(
        &self,
        corpus: &Corpus,
        previous: Option<&Manifest>,
    ) -> Result<Manifest, StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(StorageError::Write)?;

        let manifest = Manifest {
            generation: previous.map(|m| m.generation + 1).unwrap_or(1),
            entries: corpus.len(),
            dimensions: corpus.dimensions(),
            committed_at: Utc::now(),
        };

        let meta_json = corpus.metadata().to_json().map_err(StorageError::Encode)?;
        let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(StorageError::Encode)?;

        write_atomic(&self.index_path(manifest.generation), |writer| {
            write_index(writer, corpus.index())
        })
        .map_err(StorageError::Write)?;
        write_atomic(&self.meta_path(manifest.generation), |writer| {
            writer.write_all(&meta_json)
        })
        .map_err(StorageError::Write)?;

        write_atomic(&self.dir.join(MANIFEST_FILE), |writer| {
            writer.write_all(&manifest_json)
        })
        .map_err(StorageError::Write)?;

        sync_dir(&self.dir);
        self.remove_stale(manifest.generation);

        Ok(manifest)
    }

    fn index_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("index.{generation}.bin"))
    }

    fn meta_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("meta.{generation}.json"))
    }

    fn generation_moved(&self, seen: &Manifest) -> bool {
        matches!(self.read_manifest(), Ok(Some(current)) if current.generation != seen.generation)
    }

    /// Remove files of superseded generations and abandoned temp files.
    fn remove_stale(&self, current: u64) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let stale = name.ends_with(".tmp")
                || generation_of(name).is_some_and(|generation| generation != current);

            if stale {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    log::warn!("failed to remove stale corpus file {name}: {err}");
                }
            }
        }
    }

    /// Read a flat index file.
    fn read_index(&self, path: &Path) -> Result<VectorIndex, StorageError> {
        let file = File::open(path).map_err(|err| missing_is_corrupt(err, path))?;
        let file_len = file.metadata().map_err(StorageError::Read)?.len();
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader, path)?;

        let dimensions = header.dimensions as usize;
        let payload_len = usize::try_from(header.entry_count)
            .ok()
            .and_then(|count| count.checked_mul(dimensions))
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| StorageError::Corrupt(format!("{}: impossible size", path.display())))?;

        // header + payload + payload checksum must match what is on disk
        let expected_len = (HEADER_SIZE as u64)
            .checked_add(payload_len as u64)
            .and_then(|len| len.checked_add(4));
        if expected_len != Some(file_len) {
            return Err(StorageError::Corrupt(format!(
                "{}: header promises {payload_len} payload bytes, file has {file_len} bytes",
                path.display()
            )));
        }

        let mut payload = vec![0u8; payload_len];
        reader
            .read_exact(&mut payload)
            .map_err(|err| truncated_is_corrupt(err, path))?;

        let mut checksum = [0u8; 4];
        reader
            .read_exact(&mut checksum)
            .map_err(|err| truncated_is_corrupt(err, path))?;
        if u32::from_le_bytes(checksum) != crc32fast::hash(&payload) {
            return Err(StorageError::ChecksumMismatch(path.display().to_string()));
        }

        let data = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        VectorIndex::from_raw(dimensions, data)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())))
    }
}

/// Index file header structure.
#[derive(Debug)]
struct Header {
    dimensions: u32,
    entry_count: u64,
}

fn read_header(reader: &mut impl Read, path: &Path) -> Result<Header, StorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|err| truncated_is_corrupt(err, path))?;

    if &header_bytes[0..4] != MAGIC {
        return Err(StorageError::Corrupt(format!(
            "{} is not a vector index",
            path.display()
        )));
    }

    let version = header_bytes[4];
    if version > FORMAT_VERSION {
        return Err(StorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[17],
        header_bytes[18],
        header_bytes[19],
        header_bytes[20],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..17]) {
        return Err(StorageError::ChecksumMismatch(path.display().to_string()));
    }

    let dimensions = u32::from_le_bytes([
        header_bytes[5],
        header_bytes[6],
        header_bytes[7],
        header_bytes[8],
    ]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[9..17]);

    Ok(Header {
        dimensions,
        entry_count: u64::from_le_bytes(count_bytes),
    })
}

fn write_index(writer: &mut impl Write, index: &VectorIndex) -> std::io::Result<()> {
    let dimensions = u32::try_from(index.dimensions()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many dimensions")
    })?;

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes[0..4].copy_from_slice(MAGIC);
    header_bytes[4] = FORMAT_VERSION;
    header_bytes[5..9].copy_from_slice(&dimensions.to_le_bytes());
    header_bytes[9..17].copy_from_slice(&(index.len() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header_bytes[0..17]);
    header_bytes[17..21].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header_bytes)?;

    let mut hasher = crc32fast::Hasher::new();
    for value in index.as_slice() {
        let bytes = value.to_le_bytes();
        hasher.update(&bytes);
        writer.write_all(&bytes)?;
    }
    writer.write_all(&hasher.finalize().to_le_bytes())
}

/// Write through a temp file next to `path`, then rename over it.
fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let result = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        // Clean up temp file on error
        let _ = std::fs::remove_file(&temp_path);
    }

    result
}

fn sync_dir(dir: &Path) {
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
}

/// Generation number of an `index.<gen>.bin` or `meta.<gen>.json` file name.
fn generation_of(name: &str) -> Option<u64> {
    let rest = name
        .strip_prefix("index.")
        .and_then(|rest| rest.strip_suffix(".bin"))
        .or_else(|| {
            name.strip_prefix("meta.")
                .and_then(|rest| rest.strip_suffix(".json"))
        })?;
    rest.parse().ok()
}

/// A file named by the manifest that doesn't exist means the store is broken.
fn missing_is_corrupt(err: std::io::Error, path: &Path) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::Corrupt(format!("{} is missing", path.display()))
    } else {
        StorageError::Read(err)
    }
}

fn truncated_is_corrupt(err: std::io::Error, path: &Path) -> StorageError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        StorageError::Corrupt(format!("{} is truncated", path.display()))
    } else {
        StorageError::Read(err)
    }
}
