//! The memory fact model.
//!
//! A fact is an atomic, self-contained sentence about the primary user or a
//! named third party, carried with structured attributes and an embedding.
//! Facts live inside the vector store as [`StoredDocument`] records; the
//! structured attributes are kept in the record metadata so they stay
//! filterable through the store's metadata-equality conditions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::filter::META_SOURCE;
use crate::store::{DocumentType, StoredDocument};

/// Metadata key marking a record as a fact.
pub const META_KIND: &str = "kind";
/// Metadata value under [`META_KIND`] for fact records.
pub const KIND_FACT: &str = "fact";
/// Metadata key for the fact subject.
pub const META_SUBJECT: &str = "subject";
pub const META_CATEGORY: &str = "category";
pub const META_ATTRIBUTE: &str = "attribute";
pub const META_VALUE: &str = "value";
pub const META_IMPORTANCE: &str = "importance";
pub const META_SENSITIVITY: &str = "sensitivity";
pub const META_SOURCE_DOCUMENT_ID: &str = "source_document_id";

/// How sensitive a fact is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    #[default]
    Low,
    Medium,
    High,
}

impl Sensitivity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }

    /// Decodes the persisted string form, defaulting to `Low`.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "medium" => Sensitivity::Medium,
            "high" => Sensitivity::High,
            _ => Sensitivity::Low,
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic fact about the primary user or a named third party.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    /// Store-assigned UUID. Empty on candidates that have not been added
    /// yet.
    pub id: String,
    /// Natural-language sentence.
    pub content: String,
    /// Free categorisation tag.
    pub category: String,
    /// Who the fact is about; `"primaryUser"` when it refers to the primary
    /// user.
    pub subject: String,
    pub attribute: String,
    pub value: String,
    /// Importance on a 1..=3 scale.
    pub importance: u8,
    pub sensitivity: Sensitivity,
    pub timestamp: Option<DateTime<Utc>>,
    /// Id of the document the fact was extracted from.
    pub source_document_id: String,
    /// Source tag of that document.
    pub source: String,
    /// Embedding vector; empty on candidates.
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

impl MemoryFact {
    /// Creates a candidate fact awaiting reconciliation.
    pub fn candidate(
        content: impl Into<String>,
        subject: impl Into<String>,
        source_document_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            content: content.into(),
            category: "general".to_string(),
            subject: subject.into(),
            attribute: String::new(),
            value: String::new(),
            importance: 1,
            sensitivity: Sensitivity::Low,
            timestamp: None,
            source_document_id: source_document_id.into(),
            source: source.into(),
            embedding: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.attribute = attribute.into();
        self.value = value.into();
        self
    }

    /// Sets the importance, clamped into 1..=3.
    #[must_use]
    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance.clamp(1, 3);
        self
    }

    #[must_use]
    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Projects the fact into a store record. Structured attributes go into
    /// the record metadata, keyed by the `META_*` constants.
    #[must_use]
    pub fn to_stored(&self) -> StoredDocument {
        let mut doc = StoredDocument::original(self.content.clone(), self.embedding.clone());
        doc.id = self.id.clone();
        doc.timestamp = self.timestamp;
        doc.metadata = self.metadata.clone();
        doc.metadata.insert(META_KIND.into(), KIND_FACT.into());
        doc.metadata.insert(META_SUBJECT.into(), self.subject.clone());
        doc.metadata
            .insert(META_CATEGORY.into(), self.category.clone());
        doc.metadata
            .insert(META_ATTRIBUTE.into(), self.attribute.clone());
        doc.metadata.insert(META_VALUE.into(), self.value.clone());
        doc.metadata
            .insert(META_IMPORTANCE.into(), self.importance.to_string());
        doc.metadata
            .insert(META_SENSITIVITY.into(), self.sensitivity.to_string());
        doc.metadata
            .insert(META_SOURCE_DOCUMENT_ID.into(), self.source_document_id.clone());
        doc.metadata.insert(META_SOURCE.into(), self.source.clone());
        doc
    }

    /// Reconstructs a fact from a store record, or `None` when the record is
    /// not a fact.
    #[must_use]
    pub fn from_stored(doc: &StoredDocument) -> Option<Self> {
        if doc.document_type != DocumentType::Original
            || doc.metadata.get(META_KIND).map(String::as_str) != Some(KIND_FACT)
        {
            return None;
        }
        let get = |key: &str| doc.metadata.get(key).cloned().unwrap_or_default();
        let mut metadata = doc.metadata.clone();
        for key in [
            META_KIND,
            META_SUBJECT,
            META_CATEGORY,
            META_ATTRIBUTE,
            META_VALUE,
            META_IMPORTANCE,
            META_SENSITIVITY,
            META_SOURCE_DOCUMENT_ID,
            META_SOURCE,
        ] {
            metadata.remove(key);
        }
        Some(Self {
            id: doc.id.clone(),
            content: doc.content.clone(),
            category: get(META_CATEGORY),
            subject: get(META_SUBJECT),
            attribute: get(META_ATTRIBUTE),
            value: get(META_VALUE),
            importance: get(META_IMPORTANCE).parse().unwrap_or(1),
            sensitivity: Sensitivity::decode(&get(META_SENSITIVITY)),
            timestamp: doc.timestamp,
            source_document_id: get(META_SOURCE_DOCUMENT_ID),
            source: get(META_SOURCE),
            embedding: doc.vector.clone(),
            metadata,
        })
    }
}
