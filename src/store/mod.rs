//! Vector store contract and backends.
//!
//! This module defines the [`VectorStore`] trait that the rest of the engine
//! programs against, together with the record and result types it traffics
//! in. Two embedded backends are provided:
//!
//! - [`memory::MemoryVectorStore`] — in-process, for tests and small
//!   deployments;
//! - [`sqlite::SqliteVectorStore`] — persistent, built on SQLite with the
//!   `sqlite-vec` extension for cosine distance.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ VectorStore trait│
//!                  │   (async CRUD)   │
//!                  └────────┬─────────┘
//!                           │
//!                ┌──────────┴──────────┐
//!                ▼                     ▼
//!         ┌─────────────┐      ┌─────────────┐
//!         │  in-memory  │      │   SQLite    │
//!         │   backend   │      │ sqlite-vec  │
//!         └─────────────┘      └─────────────┘
//! ```
//!
//! All vectors are L2-normalised on the way in, so cosine similarity reduces
//! to a dot product and round-trips are stable within floating-point
//! tolerance.

pub mod filter;
pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

pub use filter::DocumentFilter;

/// Whether a record is a full document or a chunk of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Original,
    Chunk,
}

impl DocumentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Original => "original",
            DocumentType::Chunk => "chunk",
        }
    }

    /// Decodes the persisted string form, falling back to `Original` for
    /// unrecognised input.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "chunk" => DocumentType::Chunk,
            _ => DocumentType::Original,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as held by the vector store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Store id. Leave empty on upsert to have the store assign a UUID.
    pub id: String,
    pub content: String,
    /// Embedding vector; must match the store's configured dimension.
    pub vector: Vec<f32>,
    pub document_type: DocumentType,
    /// For chunks, the id of the parent record. Deleting the parent cascades
    /// to all records pointing at it.
    pub original_id: Option<String>,
    /// Zero-based index of a chunk within its parent.
    pub chunk_number: Option<u32>,
    pub content_hash: String,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StoredDocument {
    /// Creates an original record with a store-assigned id.
    pub fn original(content: impl Into<String>, vector: Vec<f32>) -> Self {
        let content = content.into();
        let content_hash = crate::chunking::content_hash(&[&content]);
        Self {
            id: String::new(),
            content,
            vector,
            document_type: DocumentType::Original,
            original_id: None,
            chunk_number: None,
            content_hash,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Creates a chunk record pointing at its parent.
    pub fn chunk(
        parent_id: impl Into<String>,
        chunk_number: u32,
        content: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        let content = content.into();
        let content_hash = crate::chunking::content_hash(&[&content]);
        Self {
            id: String::new(),
            content,
            vector,
            document_type: DocumentType::Chunk,
            original_id: Some(parent_id.into()),
            chunk_number: Some(chunk_number),
            content_hash,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A store record paired with its similarity to a query vector.
#[derive(Clone, Debug)]
pub struct ScoredDocument {
    pub document: StoredDocument,
    pub similarity: f32,
}

/// Per-item outcome of an upsert flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Stored,
    Failed(String),
}

/// Per-item status, keyed by the (possibly store-assigned) record id.
#[derive(Clone, Debug)]
pub struct UpsertStatus {
    pub id: String,
    pub outcome: UpsertOutcome,
}

/// Result of an upsert call: one status per input item, in input order.
#[derive(Clone, Debug, Default)]
pub struct UpsertReport {
    pub statuses: Vec<UpsertStatus>,
}

impl UpsertReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| s.outcome == UpsertOutcome::Stored)
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.statuses.len() - self.succeeded()
    }
}

/// Progress event emitted once per upserted item.
#[derive(Clone, Debug)]
pub struct UpsertProgress {
    pub id: String,
    pub processed: usize,
    pub total: usize,
}

/// Pagination request for [`VectorStore::query_documents`].
#[derive(Clone, Copy, Debug)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl PageRequest {
    #[must_use]
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// One page of structured query results.
#[derive(Clone, Debug)]
pub struct Page {
    pub items: Vec<StoredDocument>,
    pub total: usize,
    pub has_more: bool,
}

/// The storage contract the engine programs against.
///
/// Implementations are responsible for their own concurrency: concurrent
/// writes to the same record id are serialised by the backend
/// (last-writer-wins), and readers never observe half-written records.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Creates the backing schema if it does not exist. Idempotent and
    /// tolerant of concurrent creation by multiple processes.
    async fn ensure_schema(&self) -> Result<(), MemoryError>;

    /// The fixed vector dimension this store was initialised with.
    fn dimension(&self) -> usize;

    /// Writes records, assigning UUIDs to items without an id. Atomic per
    /// item, flushed in batches. A dimension mismatch anywhere in a flush
    /// batch aborts that batch with [`MemoryError::InvalidVector`]; one
    /// progress event is emitted per processed item (best-effort: pass an
    /// unbounded channel to observe all of them).
    async fn upsert(
        &self,
        documents: Vec<StoredDocument>,
        progress: Option<flume::Sender<UpsertProgress>>,
    ) -> Result<UpsertReport, MemoryError>;

    /// Top-`k` records by cosine similarity to `vector`, optionally
    /// restricted by `filter`. Ordered by similarity descending, then
    /// timestamp descending, then id ascending.
    async fn query_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<ScoredDocument>, MemoryError>;

    /// Fetches a record by id, failing with [`MemoryError::NotFound`] when
    /// absent.
    async fn get(&self, id: &str) -> Result<StoredDocument, MemoryError>;

    /// Replaces a record's content and vector, merging any explicitly passed
    /// metadata keys over the stored map. Other fields are preserved.
    async fn update(
        &self,
        id: &str,
        content: String,
        vector: Vec<f32>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), MemoryError>;

    /// Deletes a record and every chunk whose `original_id` points at it.
    /// Deleting a missing id is a success.
    async fn delete(&self, id: &str) -> Result<(), MemoryError>;

    /// Structured browse with limit/offset pagination.
    async fn query_documents(
        &self,
        filter: &DocumentFilter,
        page: PageRequest,
    ) -> Result<Page, MemoryError>;

    /// Number of records currently stored.
    async fn count(&self) -> Result<usize, MemoryError>;

    /// Drops every record. Intended for tests.
    async fn delete_all(&self) -> Result<(), MemoryError>;
}

/// Cosine similarity between two vectors. Returns 0.0 when either vector
/// has zero magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0;
    let mut mag_a = 0.0;
    let mut mag_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a.sqrt() * mag_b.sqrt())
}

/// L2-normalises a vector in place. Zero vectors are left untouched.
pub fn l2_normalise(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Canonical result ordering: similarity descending, timestamp descending
/// (records without a timestamp last), id ascending.
pub(crate) fn rank_results(results: &mut [ScoredDocument]) {
    results.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.document.timestamp.cmp(&a.document.timestamp))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
}

/// Canonical browse ordering for pagination: timestamp descending, id
/// ascending. Deterministic so limit/offset pages do not shear.
pub(crate) fn paginate(mut documents: Vec<StoredDocument>, page: PageRequest) -> Page {
    documents.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    let total = documents.len();
    let items: Vec<StoredDocument> = documents
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .collect();
    let has_more = page.offset + items.len() < total;
    Page {
        items,
        total,
        has_more,
    }
}

/// Validates a batch against the store dimension before any write.
pub(crate) fn check_dimensions(
    documents: &[StoredDocument],
    dimension: usize,
) -> Result<(), MemoryError> {
    for doc in documents {
        if doc.vector.len() != dimension {
            return Err(MemoryError::InvalidVector {
                expected: dimension,
                actual: doc.vector.len(),
            });
        }
    }
    Ok(())
}
