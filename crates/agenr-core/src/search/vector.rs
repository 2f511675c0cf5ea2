//! ANN Vector Index
//!
//! HNSW index (USearch) over entry embeddings, keyed by entry id. The index
//! is a denormalized cache of the `embedding` column: it is rebuilt from the
//! database at startup and after destructive operations, and incrementally
//! maintained on insert, supersede, and retire. Band decisions in dedup
//! recompute exact cosine from the stored vectors; the index only has to be
//! good enough to surface candidates.
//!
//! Entry ids map to usearch labels through a slab: the slot position is the
//! label, freed slots are recycled, and a label resolves back to its id by
//! indexing the slab. Upserts retire the old label and take a fresh slot,
//! so a label is never live for two generations of the same entry.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// HNSW connectivity parameter
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// usearch capacity is reserved in blocks of this many slots
const RESERVE_BLOCK: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    /// Failed to create the index
    #[error("index creation failed: {0}")]
    IndexCreation(String),
    /// Failed to add a vector
    #[error("failed to add vector: {0}")]
    IndexAdd(String),
    /// Failed to search
    #[error("search failed: {0}")]
    IndexSearch(String),
    /// Dimension mismatch
    #[error("invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions {
        /// Configured dimension
        expected: usize,
        /// Provided dimension
        got: usize,
    },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions (must match the embedding provider)
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    /// Config for a given embedding dimension with default HNSW parameters
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW vector index keyed by entry id
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    /// entry id -> live label
    labels: HashMap<String, u64>,
    /// label -> entry id; None marks a freed slot
    slots: Vec<Option<String>>,
    /// Recycled labels, reused before the slab grows
    free: Vec<u64>,
}

impl VectorIndex {
    /// Create an empty index
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            labels: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
        })
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Configured dimensionality
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Whether an entry id is indexed
    pub fn contains(&self, entry_id: &str) -> bool {
        self.labels.contains_key(entry_id)
    }

    /// Add or replace the vector for an entry id
    pub fn add(&mut self, entry_id: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        self.check_dimensions(vector.len())?;

        // An upsert retires the old label outright; the fresh vector gets
        // a fresh slot
        self.release(entry_id)?;

        self.ensure_capacity()?;
        let label = self.claim_slot(entry_id);
        self.index
            .add(label, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        Ok(())
    }

    /// Remove an entry id; Ok(false) when it was never indexed
    pub fn remove(&mut self, entry_id: &str) -> Result<bool, VectorSearchError> {
        self.release(entry_id)
    }

    /// Drop all vectors, keeping the configuration
    pub fn clear(&mut self) -> Result<(), VectorSearchError> {
        *self = Self::new(self.config.clone())?;
        Ok(())
    }

    /// Top-`limit` entry ids by cosine similarity
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        self.check_dimensions(query.len())?;

        if self.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let matches = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        // Cosine distance -> similarity; labels resolve through the slab,
        // and anything pointing at a freed slot is dropped
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(label, distance)| {
                self.resolve(*label)
                    .map(|entry_id| (entry_id.to_string(), 1.0 - distance))
            })
            .collect())
    }

    /// Top-`limit` ids at or above a similarity floor
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        let mut results = self.search(query, limit)?;
        results.retain(|(_, score)| *score >= min_similarity);
        Ok(results)
    }

    // ========================================================================
    // SLAB
    // ========================================================================

    fn check_dimensions(&self, got: usize) -> Result<(), VectorSearchError> {
        if got != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                got,
            });
        }
        Ok(())
    }

    /// Take a slot for an entry id (recycled before the slab grows) and
    /// register both directions of the mapping
    fn claim_slot(&mut self, entry_id: &str) -> u64 {
        let label = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            (self.slots.len() - 1) as u64
        });
        self.slots[label as usize] = Some(entry_id.to_string());
        self.labels.insert(entry_id.to_string(), label);
        label
    }

    /// Drop an entry's label and free its slot; Ok(false) when absent
    fn release(&mut self, entry_id: &str) -> Result<bool, VectorSearchError> {
        let Some(label) = self.labels.remove(entry_id) else {
            return Ok(false);
        };
        self.slots[label as usize] = None;
        self.free.push(label);
        self.index
            .remove(label)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        Ok(true)
    }

    /// Resolve a label through the slab
    fn resolve(&self, label: u64) -> Option<&str> {
        self.slots.get(label as usize)?.as_deref()
    }

    // usearch requires capacity to be reserved ahead of add(); reserving
    // in blocks keeps the call off the per-insert path
    fn ensure_capacity(&self) -> Result<(), VectorSearchError> {
        let needed = self.index.size() + 1;
        if needed > self.index.capacity() {
            let rounded = needed.div_ceil(RESERVE_BLOCK) * RESERVE_BLOCK;
            self.index.reserve(rounded).map_err(|e| {
                VectorSearchError::IndexCreation(format!("failed to reserve capacity: {e}"))
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
