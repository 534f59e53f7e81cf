//! A vector index and its metadata, kept in lockstep.

use serde::{Deserialize, Serialize};

use crate::semantic::index::{IndexError, VectorIndex};
use crate::semantic::metadata::{ChunkMeta, MetadataRecord, MetadataStore};

/// A ranked search hit joined with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub score: f32,
    pub text: String,
    pub source: String,
    pub meta: ChunkMeta,
}

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("index holds {vectors} vectors but metadata holds {records} records")]
    Misaligned { vectors: usize, records: usize },

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Vectors and metadata for one embedding space.
///
/// The `n`-th vector and the `n`-th metadata record always describe the
/// same chunk.
#[derive(Debug, Clone)]
pub struct Corpus {
    index: VectorIndex,
    metadata: MetadataStore,
}

impl Corpus {
    pub fn new(dimensions: usize) -> Self {
        Self {
            index: VectorIndex::new(dimensions),
            metadata: MetadataStore::new(),
        }
    }

    /// Pair an index with its metadata, refusing misaligned halves.
    pub fn from_parts(index: VectorIndex, metadata: MetadataStore) -> Result<Self, CorpusError> {
        if index.len() != metadata.len() {
            return Err(CorpusError::Misaligned {
                vectors: index.len(),
                records: metadata.len(),
            });
        }
        Ok(Self { index, metadata })
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn dimensions(&self) -> usize {
        self.index.dimensions()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Append vectors and their records as one unit.
    ///
    /// Both halves are validated before either is touched, so on error the
    /// corpus is unchanged.
    pub fn append(
        &mut self,
        vectors: &[Vec<f32>],
        records: Vec<MetadataRecord>,
    ) -> Result<(), CorpusError> {
        if vectors.len() != records.len() {
            return Err(CorpusError::Misaligned {
                vectors: vectors.len(),
                records: records.len(),
            });
        }
        self.index.validate(vectors)?;

        self.index.add(vectors)?;
        self.metadata.append(records);

        Ok(())
    }

    /// Top-`k` hits for `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, CorpusError> {
        let results = self.index.search(query, k)?;

        Ok(results
            .into_iter()
            .filter_map(|result| {
                self.metadata.get(result.position).map(|record| Hit {
                    score: result.score,
                    text: record.text.clone(),
                    source: record.source.clone(),
                    meta: record.meta.clone(),
                })
            })
            .collect())
    }
}
