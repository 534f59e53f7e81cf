//! Retrieval service for the knowledge base.
//!
//! Composes extraction, chunking, embedding and corpus storage:
//! - `ingest`: documents -> chunks -> vectors -> committed corpus generation
//! - `search`: query -> vector -> top-k hits from the committed corpus
//!
//! Embedding runs before the writer lock is taken, so a slow or failing
//! backend never holds up other writers and never reaches the disk.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, EmbeddingBackend};
use crate::semantic::chunker::{chunk_document, Chunk};
use crate::semantic::corpus::{Corpus, CorpusError, Hit};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::extract::{extract_text, Document};
use crate::semantic::index::IndexError;
use crate::semantic::metadata::MetadataRecord;
use crate::semantic::storage::{CorpusStorage, Manifest, StorageError};

/// Stable failure codes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    InvalidInput,
    Auth,
    Quota,
    Transient,
    MalformedResponse,
    Rejected,
    ModelUnavailable,
    DimensionMismatch,
    CorruptStore,
    Persistence,
    Internal,
}

/// Errors that can occur during retrieval operations.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("Embedding has {got} dimensions but the corpus stores {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RetrievalError {
    pub fn cause(&self) -> ErrorCause {
        match self {
            RetrievalError::InvalidInput(_) => ErrorCause::InvalidInput,
            RetrievalError::Embedding(err) => match err {
                EmbeddingError::ModelUnavailable(_) => ErrorCause::ModelUnavailable,
                EmbeddingError::Auth(_) => ErrorCause::Auth,
                EmbeddingError::Quota(_) => ErrorCause::Quota,
                EmbeddingError::Transient(_) => ErrorCause::Transient,
                EmbeddingError::MalformedResponse(_) => ErrorCause::MalformedResponse,
                EmbeddingError::Rejected(_) => ErrorCause::Rejected,
            },
            RetrievalError::DimensionMismatch { .. } => ErrorCause::DimensionMismatch,
            RetrievalError::Storage(err) => match err {
                StorageError::VersionMismatch(..)
                | StorageError::ChecksumMismatch(_)
                | StorageError::Corrupt(_) => ErrorCause::CorruptStore,
                StorageError::Read(_) | StorageError::Write(_) | StorageError::Encode(_) => {
                    ErrorCause::Persistence
                }
            },
            RetrievalError::Internal(_) => ErrorCause::Internal,
        }
    }
}

impl From<CorpusError> for RetrievalError {
    fn from(err: CorpusError) -> Self {
        match err {
            CorpusError::Index(IndexError::DimensionMismatch { expected, got }) => {
                RetrievalError::DimensionMismatch { expected, got }
            }
            other => RetrievalError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub added_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub ok: bool,
    pub hits: Vec<Hit>,
}

/// Structured failure returned instead of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureResponse {
    pub ok: bool,
    pub cause: ErrorCause,
    pub error: String,
}

impl From<&RetrievalError> for FailureResponse {
    fn from(err: &RetrievalError) -> Self {
        Self {
            ok: false,
            cause: err.cause(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusState {
    Absent,
    Present,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub space_id: String,
    pub backend: EmbeddingBackend,
    pub model: String,
    pub kb_dir: PathBuf,
    pub state: CorpusState,
    pub entries: usize,
    pub dimensions: Option<usize>,
    pub generation: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Configuration-derived state, swapped as a whole by `reconfigure`.
struct Active {
    config: Config,
    embedder: Embedder,
    space_id: String,
}

impl Active {
    fn new(config: Config) -> Result<Self, RetrievalError> {
        let embedder = Embedder::from_config(&config.embedding, &config.kb_dir)?;
        let space_id = config.embedding.space_id();
        log::info!(
            "embedding space {} ({} backend, model {})",
            space_id,
            embedder.backend(),
            embedder.model()
        );

        Ok(Self {
            config,
            embedder,
            space_id,
        })
    }

    fn storage(&self) -> CorpusStorage {
        CorpusStorage::new(&self.config.kb_dir, &self.space_id)
    }
}

/// Last corpus generation seen by this process.
struct Snapshot {
    space_id: String,
    generation: u64,
    corpus: Arc<Corpus>,
}

/// Service for ingesting documents and searching the knowledge base.
///
/// Thread-safe: searches run against immutable snapshots, ingests are
/// serialized per embedding space by the corpus writer lock.
pub struct RetrievalService {
    active: RwLock<Arc<Active>>,
    cache: Mutex<Option<Snapshot>>,
}

impl RetrievalService {
    pub fn new(config: Config) -> Result<Self, RetrievalError> {
        Ok(Self {
            active: RwLock::new(Arc::new(Active::new(config)?)),
            cache: Mutex::new(None),
        })
    }

    /// Switch to a new configuration.
    ///
    /// Rebuilds the embedder and drops the cached corpus. On error the
    /// previous configuration stays active.
    pub fn reconfigure(&self, config: Config) -> Result<(), RetrievalError> {
        let next = Arc::new(Active::new(config)?);

        let mut active = self
            .active
            .write()
            .map_err(|e| RetrievalError::Internal(format!("Lock poisoned: {}", e)))?;
        *active = next;
        drop(active);

        self.invalidate();
        Ok(())
    }

    /// Ingest documents and return the number of chunks added.
    pub fn ingest(&self, documents: &[Document]) -> Result<usize, RetrievalError> {
        let active = self.active()?;
        let config = &active.config;

        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| {
                let text = extract_text(doc);
                let chunks = chunk_document(
                    &text,
                    &doc.source(),
                    config.chunk_size,
                    config.chunk_overlap,
                );
                log::debug!("{}: {} chunks", doc.filename, chunks.len());
                chunks
            })
            .collect();

        if chunks.is_empty() {
            log::info!("nothing to ingest from {} documents", documents.len());
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = active.embedder.embed(&texts)?;
        let dimensions = vectors.first().map(Vec::len).unwrap_or(0);

        let storage = active.storage();
        let _lock = storage.lock()?;

        let previous = storage.read_manifest()?;
        let mut corpus = match &previous {
            Some(manifest) => self.owned_generation(&active, &storage, manifest)?,
            None => Corpus::new(dimensions),
        };

        if corpus.dimensions() != dimensions {
            return Err(RetrievalError::DimensionMismatch {
                expected: corpus.dimensions(),
                got: dimensions,
            });
        }

        let ingested_at = Utc::now().timestamp();
        let added = chunks.len();
        let records: Vec<MetadataRecord> = chunks
            .into_iter()
            .map(|chunk| MetadataRecord::from_chunk(chunk, ingested_at))
            .collect();
        corpus.append(&vectors, records)?;

        let manifest = storage.commit(&corpus, previous.as_ref())?;
        log::info!(
            "ingested {} chunks into {} (generation {}, {} entries)",
            added,
            active.space_id,
            manifest.generation,
            manifest.entries
        );

        self.publish(Snapshot {
            space_id: active.space_id.clone(),
            generation: manifest.generation,
            corpus: Arc::new(corpus),
        });

        Ok(added)
    }

    /// Return the `k` best hits for `query`, best first.
    ///
    /// An absent or empty corpus yields no hits without calling the
    /// embedder.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<Hit>, RetrievalError> {
        if k == 0 {
            return Ok(vec![]);
        }

        let active = self.active()?;
        let corpus = match self.snapshot(&active)? {
            Some(corpus) if !corpus.is_empty() => corpus,
            _ => return Ok(vec![]),
        };

        let query_vector = active
            .embedder
            .embed(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Internal("No embedding returned".to_string()))?;

        Ok(corpus.search(&query_vector, k)?)
    }

    pub fn status(&self) -> Result<StatusResponse, RetrievalError> {
        let active = self.active()?;
        let manifest = active.storage().read_manifest()?;

        Ok(StatusResponse {
            ok: true,
            space_id: active.space_id.clone(),
            backend: active.embedder.backend(),
            model: active.embedder.model().to_string(),
            kb_dir: active.config.kb_dir.clone(),
            state: if manifest.is_some() {
                CorpusState::Present
            } else {
                CorpusState::Absent
            },
            entries: manifest.as_ref().map(|m| m.entries).unwrap_or(0),
            dimensions: manifest.as_ref().map(|m| m.dimensions),
            generation: manifest.as_ref().map(|m| m.generation),
            committed_at: manifest.as_ref().map(|m| m.committed_at),
        })
    }

    fn active(&self) -> Result<Arc<Active>, RetrievalError> {
        self.active
            .read()
            .map(|active| Arc::clone(&active))
            .map_err(|e| RetrievalError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Committed corpus for the active space, from cache when still current.
    fn snapshot(&self, active: &Active) -> Result<Option<Arc<Corpus>>, RetrievalError> {
        let storage = active.storage();
        let Some(manifest) = storage.read_manifest()? else {
            return Ok(None);
        };

        if let Some(corpus) = self.cached(&active.space_id, manifest.generation) {
            return Ok(Some(corpus));
        }

        let Some((manifest, corpus)) = storage.load()? else {
            return Ok(None);
        };
        log::debug!(
            "loaded generation {} of {} ({} entries)",
            manifest.generation,
            active.space_id,
            manifest.entries
        );

        let corpus = Arc::new(corpus);
        self.publish(Snapshot {
            space_id: active.space_id.clone(),
            generation: manifest.generation,
            corpus: Arc::clone(&corpus),
        });
        Ok(Some(corpus))
    }

    /// Mutable copy of the generation named by `manifest`.
    fn owned_generation(
        &self,
        active: &Active,
        storage: &CorpusStorage,
        manifest: &Manifest,
    ) -> Result<Corpus, RetrievalError> {
        match self.cached(&active.space_id, manifest.generation) {
            Some(corpus) => Ok(Corpus::clone(&corpus)),
            None => Ok(storage.load_generation(manifest)?),
        }
    }

    fn cached(&self, space_id: &str, generation: u64) -> Option<Arc<Corpus>> {
        let guard = self.cache.lock().ok()?;
        guard
            .as_ref()
            .filter(|snapshot| snapshot.space_id == space_id && snapshot.generation == generation)
            .map(|snapshot| Arc::clone(&snapshot.corpus))
    }

    fn publish(&self, snapshot: Snapshot) {
        if let Ok(mut guard) = self.cache.lock() {
            // never replace a newer generation of the same space
            let stale = guard.as_ref().is_some_and(|current| {
                current.space_id == snapshot.space_id && current.generation > snapshot.generation
            });
            if !stale {
                *guard = Some(snapshot);
            }
        }
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = None;
        }
    }
}
