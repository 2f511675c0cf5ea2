//! Search Module
//!
//! Candidate generation for dedup and recall:
//! - ANN vector search over entry embeddings (HNSW via USearch)
//! - FTS5 keyword search with query sanitization

mod fts;
mod vector;

pub use fts::sanitize_fts5_query;
pub use vector::{VectorIndex, VectorIndexConfig, VectorSearchError};
