//! Knowledge Entry - The fundamental unit of durable memory
//!
//! Each entry carries:
//! - A typed subject/content pair extracted from a transcript
//! - Dedup identity (content hash, canonical key, subject key)
//! - Recall bookkeeping (counters, spaced-repetition intervals)
//! - Lifecycle state (supersession, retirement, suppression)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Importance assigned when the extractor omits one (1-10 scale).
pub const DEFAULT_IMPORTANCE: i64 = 7;

// ============================================================================
// ENTRY TYPES
// ============================================================================

/// Types of knowledge entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// A discrete fact about the world or the user
    #[default]
    Fact,
    /// A decision that was made and the context around it
    Decision,
    /// A standing preference (tools, style, workflow)
    Preference,
    /// An open task
    Todo,
    /// A lesson learned the hard way
    Lesson,
    /// Something that happened at a point in time
    Event,
}

impl EntryType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Fact => "fact",
            EntryType::Decision => "decision",
            EntryType::Preference => "preference",
            EntryType::Todo => "todo",
            EntryType::Lesson => "lesson",
            EntryType::Event => "event",
        }
    }

    /// Parse from string name; unknown names are an error at the boundary
    pub fn parse_name(s: &str) -> Result<Self, EntryError> {
        match s.to_lowercase().as_str() {
            "fact" => Ok(EntryType::Fact),
            "decision" => Ok(EntryType::Decision),
            "preference" => Ok(EntryType::Preference),
            "todo" => Ok(EntryType::Todo),
            "lesson" => Ok(EntryType::Lesson),
            "event" => Ok(EntryType::Event),
            other => Err(EntryError::InvalidEnum {
                field: "type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expiry class controlling how long an entry stays relevant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Expiry {
    /// Always surfaced at session start, never expires
    Core,
    /// Long-lived knowledge
    #[default]
    Permanent,
    /// Short-lived knowledge (weeks)
    Temporary,
    /// Only meaningful within the originating session
    SessionOnly,
}

impl Expiry {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Expiry::Core => "core",
            Expiry::Permanent => "permanent",
            Expiry::Temporary => "temporary",
            Expiry::SessionOnly => "session-only",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Result<Self, EntryError> {
        match s.to_lowercase().as_str() {
            "core" => Ok(Expiry::Core),
            "permanent" => Ok(Expiry::Permanent),
            "temporary" => Ok(Expiry::Temporary),
            "session-only" => Ok(Expiry::SessionOnly),
            other => Err(EntryError::InvalidEnum {
                field: "expiry",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Expiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Visibility scope of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Never leaves this machine
    #[default]
    Private,
    /// Shareable with the user's own agents
    Personal,
    /// Shareable anywhere
    Public,
}

impl Scope {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Private => "private",
            Scope::Personal => "personal",
            Scope::Public => "public",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Result<Self, EntryError> {
        match s.to_lowercase().as_str() {
            "private" => Ok(Scope::Private),
            "personal" => Ok(Scope::Personal),
            "public" => Ok(Scope::Public),
            other => Err(EntryError::InvalidEnum {
                field: "scope",
                value: other.to_string(),
            }),
        }
    }
}

/// Directed relation between two entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    /// Source replaces target
    Supersedes,
    /// Source conflicts with target
    Contradicts,
    /// Source adds detail to target
    Elaborates,
    /// Source is loosely connected to target
    Related,
}

impl RelationType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Supersedes => "supersedes",
            RelationType::Contradicts => "contradicts",
            RelationType::Elaborates => "elaborates",
            RelationType::Related => "related",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Result<Self, EntryError> {
        match s.to_lowercase().as_str() {
            "supersedes" => Ok(RelationType::Supersedes),
            "contradicts" => Ok(RelationType::Contradicts),
            "elaborates" => Ok(RelationType::Elaborates),
            "related" => Ok(RelationType::Related),
            other => Err(EntryError::InvalidEnum {
                field: "relation_type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Validation errors raised at the wire boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntryError {
    /// An enum field carried an unrecognized value
    #[error("invalid value for {field}: {value:?}")]
    InvalidEnum {
        /// Field name
        field: &'static str,
        /// Offending value
        value: String,
    },
    /// A field failed validation
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },
}

// ============================================================================
// SUBJECT KEY
// ============================================================================

/// Structured `entity/attribute` label enabling fuzzy and cross-entity lookup
///
/// Two written forms are accepted when parsing:
/// - `entity/attribute` (current)
/// - `person:X|attr:Y` (legacy, produced by early extractors)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectKey {
    /// Who or what the key is about
    pub entity: String,
    /// Which attribute of the entity
    pub attribute: String,
}

impl SubjectKey {
    /// Parse either written form; returns None for keys with no structure
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_lowercase();
        if raw.is_empty() {
            return None;
        }

        // Legacy form: person:X|attr:Y
        if let Some((person_part, attr_part)) = raw.split_once('|') {
            let entity = person_part.strip_prefix("person:")?.trim().to_string();
            let attribute = attr_part.strip_prefix("attr:")?.trim().to_string();
            if entity.is_empty() || attribute.is_empty() {
                return None;
            }
            return Some(Self { entity, attribute });
        }

        let (entity, attribute) = raw.split_once('/')?;
        let entity = entity.trim().to_string();
        let attribute = attribute.trim().to_string();
        if entity.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(Self { entity, attribute })
    }

    /// Canonical written form, lowercase `entity/attribute`
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.entity, self.attribute)
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.attribute)
    }
}

// ============================================================================
// WIRE INPUT
// ============================================================================

/// Source provenance of an entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceRef {
    /// Path or URI of the transcript the entry came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Free-text context (surrounding conversation, chunk label)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// A knowledge entry as produced by the extractor and accepted by the store
/// pipeline (also the JSON import/export element format).
///
/// Uses `deny_unknown_fields` so malformed extractor output fails loudly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeEntry {
    /// Entry type
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Short natural-language label
    pub subject: String,
    /// Prose body
    pub content: String,
    /// Stable identifier across rewordings (e.g. `preferred-package-manager`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_key: Option<String>,
    /// Structured `entity/attribute` label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_key: Option<String>,
    /// 1-10, defaults to 7
    #[serde(default = "default_importance")]
    pub importance: i64,
    /// Expiry class
    #[serde(default)]
    pub expiry: Expiry,
    /// Visibility scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    /// Originating platform tag (openclaw, claude-code, codex, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Lowercase project slug
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Free-form tag set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Provenance
    #[serde(default)]
    pub source: SourceRef,
    /// Creation timestamp override (ISO-8601 UTC); `now` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_importance() -> i64 {
    DEFAULT_IMPORTANCE
}

impl Default for KnowledgeEntry {
    fn default() -> Self {
        Self {
            entry_type: EntryType::Fact,
            subject: String::new(),
            content: String::new(),
            canonical_key: None,
            subject_key: None,
            importance: DEFAULT_IMPORTANCE,
            expiry: Expiry::Permanent,
            scope: None,
            platform: None,
            project: None,
            tags: Vec::new(),
            source: SourceRef::default(),
            created_at: None,
        }
    }
}

impl KnowledgeEntry {
    /// Validate boundary constraints
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.subject.trim().is_empty() {
            return Err(EntryError::InvalidField {
                field: "subject",
                reason: "must not be empty".to_string(),
            });
        }
        if self.content.trim().is_empty() {
            return Err(EntryError::InvalidField {
                field: "content",
                reason: "must not be empty".to_string(),
            });
        }
        if !(1..=10).contains(&self.importance) {
            return Err(EntryError::InvalidField {
                field: "importance",
                reason: format!("must be 1-10, got {}", self.importance),
            });
        }
        if let Some(project) = &self.project {
            let ok = !project.is_empty()
                && project
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
            if !ok {
                return Err(EntryError::InvalidField {
                    field: "project",
                    reason: format!("must be a lowercase slug, got {project:?}"),
                });
            }
        }
        Ok(())
    }

    /// Canonical text handed to the embedding provider
    pub fn embed_text(&self) -> String {
        format!("{}\n{}\n{}", self.subject, self.content, self.entry_type)
    }

    /// Idempotency key over `(source_file, content)`
    pub fn content_hash(&self) -> String {
        content_hash(self.source.file.as_deref(), &self.content)
    }

    /// Subject key normalized to its canonical written form
    pub fn normalized_subject_key(&self) -> Option<String> {
        self.subject_key
            .as_deref()
            .and_then(SubjectKey::parse)
            .map(|k| k.canonical())
    }
}

// ============================================================================
// STORED ENTRY
// ============================================================================

/// A fully materialized database row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    /// UUID v4
    pub id: String,
    /// Entry type
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Short natural-language label
    pub subject: String,
    /// Prose body
    pub content: String,
    /// Stable identifier across rewordings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_key: Option<String>,
    /// Structured `entity/attribute` label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_key: Option<String>,
    /// 1-10
    pub importance: i64,
    /// Expiry class
    pub expiry: Expiry,
    /// Visibility scope
    pub scope: Scope,
    /// Originating platform tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Lowercase project slug
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Free-form tag set
    #[serde(default)]
    pub tags: Vec<String>,
    /// Transcript path or URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Free-text provenance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    /// Idempotency hash of `(source_file, content)`
    pub content_hash: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
    /// Last time recall returned this entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recalled_at: Option<DateTime<Utc>>,
    /// Times recall returned this entry
    pub recall_count: i64,
    /// Times a reworded duplicate reinforced this entry
    pub confirmations: i64,
    /// Times a contradicting entry was flagged against this one
    pub contradictions: i64,
    /// Unix-second timestamps of past recalls, append-only
    #[serde(default)]
    pub recall_intervals: Vec<i64>,
    /// Entry id that replaced this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// Manually retired
    pub retired: bool,
    /// When the entry was retired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    /// Why the entry was retired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_reason: Option<String>,
    /// Recall contexts this entry is suppressed in
    #[serde(default)]
    pub suppressed_contexts: Vec<String>,
    /// Whether an embedding is stored for this entry
    pub has_embedding: bool,
}

impl StoredEntry {
    /// Active = neither superseded nor retired; only active entries are
    /// recalled, indexed, or considered by dedup.
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none() && !self.retired
    }

    /// Canonical text handed to the embedding provider
    pub fn embed_text(&self) -> String {
        format!("{}\n{}\n{}", self.subject, self.content, self.entry_type)
    }

    /// Subject key parsed into structured form (accepts the legacy form)
    pub fn parsed_subject_key(&self) -> Option<SubjectKey> {
        self.subject_key.as_deref().and_then(SubjectKey::parse)
    }

    /// Age in fractional days at `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

// ============================================================================
// NORMALIZATION HELPERS
// ============================================================================

/// Stable hash of `(source_file, content)` - the idempotency key
pub fn content_hash(source_file: Option<&str>, content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source_file.unwrap_or("").as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Lowercase, trim, collapse inner whitespace - used for batch dedup keys
/// and same-subject comparison
pub fn normalize_subject(subject: &str) -> String {
    subject
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase and trim a tag; empty result means the tag is dropped
pub fn normalize_tag(tag: &str) -> Option<String> {
    let t = tag.trim().to_lowercase();
    if t.is_empty() { None } else { Some(t) }
}

// ============================================================================
// TESTS
// ============================================================================
