//! Memory Model
//!
//! The entry model shared by every subsystem:
//! - Wire-format knowledge entries (extractor output, import format)
//! - Stored entries (database rows with lifecycle state)
//! - Entry/expiry/scope/relation enums
//! - Canonical embed text and content hashing

mod entry;

pub use entry::{
    content_hash, normalize_subject, normalize_tag, EntryError, EntryType, Expiry, KnowledgeEntry,
    RelationType, Scope, SourceRef, StoredEntry, SubjectKey, DEFAULT_IMPORTANCE,
};
