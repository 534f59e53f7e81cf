//! Metadata records kept parallel to the vector index.

use serde::{Deserialize, Serialize};

use crate::semantic::chunker::Chunk;

/// Per-chunk metadata exposed with every search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub position: usize,
}

/// One record per indexed vector, same position as the vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub text: String,
    pub source: String,
    pub meta: ChunkMeta,
    /// Unix timestamp (seconds) of the ingestion batch
    pub ingested_at: i64,
}

impl MetadataRecord {
    pub fn from_chunk(chunk: Chunk, ingested_at: i64) -> Self {
        Self {
            text: chunk.text,
            source: chunk.source,
            meta: ChunkMeta {
                position: chunk.position,
            },
            ingested_at,
        }
    }
}

/// Ordered, append-only list of metadata records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataStore {
    records: Vec<MetadataRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, records: impl IntoIterator<Item = MetadataRecord>) {
        self.records.extend(records);
    }

    pub fn get(&self, position: usize) -> Option<&MetadataRecord> {
        self.records.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
