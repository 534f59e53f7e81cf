//! In-memory flat vector index with inner-product search.
//!
//! Vectors are stored back to back in a single buffer and addressed by
//! insertion order. There is no deletion and no update: position `n` always
//! refers to the `n`-th vector ever added.

use std::cmp::Ordering;

use rayon::prelude::*;

/// Flat inner-product index over unit-normalized vectors.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// Row-major vector storage, `count * dimensions` floats
    data: Vec<f32>,
    /// Fixed embedding dimensions
    dimensions: usize,
    count: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Insertion position of the matching vector
    pub position: usize,
    /// Inner product with the normalized query, in [-1.0, 1.0]
    pub score: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
            count: 0,
        }
    }

    /// Rebuild an index from a row-major buffer, as read back from storage.
    pub fn from_raw(dimensions: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dimensions == 0 {
            if !data.is_empty() {
                return Err(IndexError::DimensionMismatch {
                    expected: 0,
                    got: data.len(),
                });
            }
            return Ok(Self::new(0));
        }
        if data.len() % dimensions != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: data.len() % dimensions,
            });
        }
        let count = data.len() / dimensions;
        Ok(Self {
            data,
            dimensions,
            count,
        })
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Raw row-major storage.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Get the vector stored at `position`.
    pub fn get(&self, position: usize) -> Option<&[f32]> {
        if position >= self.count {
            return None;
        }
        let start = position * self.dimensions;
        Some(&self.data[start..start + self.dimensions])
    }

    /// Check that a batch could be appended without actually appending it.
    pub fn validate(&self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        for vector in vectors {
            if vector.len() != self.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimensions,
                    got: vector.len(),
                });
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(IndexError::NonFiniteVector);
            }
            if l2_norm(vector) < f32::EPSILON {
                return Err(IndexError::ZeroNormVector);
            }
        }
        Ok(())
    }

    /// Append vectors in order.
    ///
    /// The whole batch is validated first; on error nothing is appended.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        self.validate(vectors)?;

        self.data.reserve(vectors.len() * self.dimensions);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        self.count += vectors.len();

        Ok(())
    }

    /// Return the `k` entries with the highest inner product against `query`.
    ///
    /// The query is normalized first. Results are sorted by score, highest
    /// first; equal scores keep insertion order. An empty index or `k == 0`
    /// returns nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON || !query_norm.is_finite() {
            return Err(IndexError::ZeroNormVector);
        }
        let query: Vec<f32> = query.iter().map(|x| x / query_norm).collect();

        let scores: Vec<f32> = self
            .data
            .par_chunks_exact(self.dimensions)
            // adding +0.0 folds -0.0 into 0.0 so orthogonal rows tie
            .map(|row| (dot(&query, row) + 0.0).clamp(-1.0, 1.0))
            .collect();

        let mut results: Vec<SearchResult> = scores
            .into_iter()
            .enumerate()
            .map(|(position, score)| SearchResult { position, score })
            .collect();

        if k < results.len() {
            results.select_nth_unstable_by(k - 1, rank);
            results.truncate(k);
        }
        results.sort_by(rank);

        Ok(results)
    }
}

/// Descending score, then ascending position.
fn rank(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.position.cmp(&b.position))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place.
///
/// Returns `false` and leaves `v` untouched when it has zero or non-finite
/// norm.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm < f32::EPSILON || !norm.is_finite() {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector contains NaN or infinite components")]
    NonFiniteVector,
}
