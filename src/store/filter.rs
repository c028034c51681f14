//! Structured filter DSL for store queries.
//!
//! A [`DocumentFilter`] is a conjunction: a record matches only when every
//! populated condition holds. Backends may evaluate filters in-process or
//! compile parts of them to their native query language; the in-process
//! [`matches`](DocumentFilter::matches) predicate is the reference
//! semantics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DocumentType, StoredDocument};

/// Metadata key under which a record's source tag is stored.
pub const META_SOURCE: &str = "source";

/// Conjunction of record conditions.
///
/// # Examples
///
/// ```
/// use memloom::store::{DocumentFilter, DocumentType};
///
/// let filter = DocumentFilter::new()
///     .with_document_type(DocumentType::Chunk)
///     .with_original_id("parent-1")
///     .with_tag("inbox");
/// assert!(!filter.is_empty());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub document_type: Option<DocumentType>,
    pub original_id: Option<String>,
    pub content_hash: Option<String>,
    /// Tags that must all be present in the record's tag set.
    pub tags: Vec<String>,
    /// Metadata keys that must be present with exactly these values.
    pub metadata: BTreeMap<String, String>,
    /// Inclusive lower bound on the record timestamp.
    pub timestamp_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp.
    pub timestamp_to: Option<DateTime<Utc>>,
}

impl DocumentFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_document_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = Some(document_type);
        self
    }

    #[must_use]
    pub fn with_original_id(mut self, original_id: impl Into<String>) -> Self {
        self.original_id = Some(original_id.into());
        self
    }

    #[must_use]
    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Equality on the record's source tag (stored under the
    /// [`META_SOURCE`] metadata key).
    #[must_use]
    pub fn with_source(self, source: impl Into<String>) -> Self {
        self.with_metadata(META_SOURCE, source)
    }

    #[must_use]
    pub fn with_timestamp_from(mut self, from: DateTime<Utc>) -> Self {
        self.timestamp_from = Some(from);
        self
    }

    #[must_use]
    pub fn with_timestamp_to(mut self, to: DateTime<Utc>) -> Self {
        self.timestamp_to = Some(to);
        self
    }

    /// Whether no condition is populated (matches everything).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document_type.is_none()
            && self.original_id.is_none()
            && self.content_hash.is_none()
            && self.tags.is_empty()
            && self.metadata.is_empty()
            && self.timestamp_from.is_none()
            && self.timestamp_to.is_none()
    }

    /// Reference matching semantics: every populated condition must hold.
    ///
    /// Records without a timestamp fail any timestamp-range condition.
    #[must_use]
    pub fn matches(&self, document: &StoredDocument) -> bool {
        if let Some(document_type) = self.document_type
            && document.document_type != document_type
        {
            return false;
        }
        if let Some(original_id) = &self.original_id
            && document.original_id.as_deref() != Some(original_id.as_str())
        {
            return false;
        }
        if let Some(content_hash) = &self.content_hash
            && document.content_hash != *content_hash
        {
            return false;
        }
        if !self.tags.iter().all(|tag| document.tags.contains(tag)) {
            return false;
        }
        for (key, value) in &self.metadata {
            if document.metadata.get(key) != Some(value) {
                return false;
            }
        }
        if self.timestamp_from.is_some() || self.timestamp_to.is_some() {
            let Some(timestamp) = document.timestamp else {
                return false;
            };
            if let Some(from) = self.timestamp_from
                && timestamp < from
            {
                return false;
            }
            if let Some(to) = self.timestamp_to
                && timestamp > to
            {
                return false;
            }
        }
        true
    }
}
