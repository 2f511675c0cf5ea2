//! Embedding Layer
//!
//! The embedding provider is an external collaborator (API or local model)
//! behind the [`EmbeddingProvider`] trait: hand it texts, get back unit-norm
//! vectors of a fixed dimension. This module adds:
//!
//! - Byte packing for the database `embedding` column
//! - Cosine similarity
//! - A per-process batch cache keyed by canonical embed text, so one
//!   ingestion batch never embeds the same text twice

use std::collections::HashMap;

use async_trait::async_trait;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding errors
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Provider returned a different number of vectors than texts sent
    #[error("embedding shape mismatch: sent {sent} texts, received {received} vectors")]
    ShapeMismatch {
        /// Texts sent
        sent: usize,
        /// Vectors received
        received: usize,
    },
    /// Provider returned a vector of the wrong dimensionality
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Configured dimension
        expected: usize,
        /// Returned dimension
        got: usize,
    },
    /// Provider call failed (network, auth, rate limit)
    #[error("embedding provider error: {0}")]
    Provider(String),
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// External embedding provider contract
///
/// Implementations must return exactly one unit-norm vector per input text,
/// in input order, all of the same dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The fixed dimension this provider produces
    fn dimensions(&self) -> usize;
}

// ============================================================================
// EMBEDDING
// ============================================================================

/// A single embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The vector values
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Wrap a raw vector
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// Dimensionality
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Pack to little-endian f32 bytes for the `embedding` BLOB column
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Unpack from the `embedding` BLOB column
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }

    /// Normalize to unit length in place
    pub fn normalize(&mut self) {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.vector {
                *v /= norm;
            }
        }
    }
}

/// Cosine similarity between two vectors; 0.0 on length mismatch
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 { dot / denominator } else { 0.0 }
}

// ============================================================================
// BATCH CACHE
// ============================================================================

/// Per-process cache keyed by canonical embed text
///
/// Purely an economy measure: discarding it is always safe.
#[derive(Default)]
pub struct EmbeddingCache {
    cache: HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached texts
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop all cached vectors
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Resolve one vector per input text, in input order
    ///
    /// Distinct texts missing from the cache are embedded in a single
    /// provider call. A count mismatch from the provider fails the whole
    /// batch with [`EmbeddingError::ShapeMismatch`].
    pub async fn resolve(
        &mut self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut missing: Vec<String> = Vec::new();
        for text in texts {
            if !self.cache.contains_key(text) && !missing.contains(text) {
                missing.push(text.clone());
            }
        }

        if !missing.is_empty() {
            let vectors = provider.embed(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(EmbeddingError::ShapeMismatch {
                    sent: missing.len(),
                    received: vectors.len(),
                });
            }
            let expected = provider.dimensions();
            for (text, vector) in missing.into_iter().zip(vectors) {
                if vector.len() != expected {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected,
                        got: vector.len(),
                    });
                }
                self.cache.insert(text, vector);
            }
        }

        Ok(texts
            .iter()
            .map(|t| self.cache.get(t).cloned().unwrap_or_default())
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
