//! Retrieval over a user-supplied document corpus.
//!
//! Documents are chunked, embedded and appended to a per-embedding-space
//! corpus on disk; queries are embedded the same way and answered with the
//! most similar chunks.
//!
//! # Architecture
//!
//! - `extract`: bytes + filename -> plain text
//! - `chunker`: overlapping fixed-size character windows
//! - `embeddings`: local (fastembed) or remote (OpenAI-compatible) vectors
//! - `identity`: fingerprint naming each embedding space
//! - `index`: flat inner-product index over unit vectors
//! - `metadata`: records parallel to the index entries
//! - `corpus`: index + metadata kept in lockstep
//! - `storage`: generation-based persistence of a corpus
//! - `service`: ingest/search entry points

pub mod chunker;
pub mod corpus;
pub mod embeddings;
pub mod extract;
pub mod identity;
pub mod index;
pub mod metadata;
mod service;
pub mod storage;

pub use extract::Document;
pub use service::{
    CorpusState, ErrorCause, FailureResponse, IngestResponse, RetrievalError, RetrievalService,
    SearchResponse, StatusResponse,
};
