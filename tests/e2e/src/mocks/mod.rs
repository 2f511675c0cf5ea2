//! Provider mocks

mod fixtures;

pub use fixtures::{entry, DeterministicEmbedder, ScriptedLlm, EMBED_DIMS};
