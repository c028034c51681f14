//! In-process vector store backend.
//!
//! Keeps every record in a [`tokio::sync::RwLock`]-guarded map and scores
//! similarity with a full cosine scan. Intended for tests and small
//! deployments; the semantics are identical to the SQLite backend, which
//! makes this the reference implementation of the [`VectorStore`] contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::MemoryError;

use super::{
    DocumentFilter, Page, PageRequest, ScoredDocument, StoredDocument, UpsertOutcome,
    UpsertProgress, UpsertReport, UpsertStatus, VectorStore, check_dimensions, cosine_similarity,
    l2_normalise, paginate, rank_results,
};

/// In-memory [`VectorStore`] implementation.
pub struct MemoryVectorStore {
    dimension: usize,
    batch_max: usize,
    records: RwLock<FxHashMap<String, StoredDocument>>,
}

impl MemoryVectorStore {
    /// Creates an empty store for vectors of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            batch_max: 100,
            records: RwLock::new(FxHashMap::default()),
        }
    }

    /// Overrides the internal flush batch size (default 100).
    #[must_use]
    pub fn with_upsert_batch_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max.max(1);
        self
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_schema(&self) -> Result<(), MemoryError> {
        // Nothing to create; the map is the schema.
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(
        &self,
        documents: Vec<StoredDocument>,
        progress: Option<flume::Sender<UpsertProgress>>,
    ) -> Result<UpsertReport, MemoryError> {
        let total = documents.len();
        let mut report = UpsertReport::default();
        let mut processed = 0usize;

        for batch in documents.chunks(self.batch_max) {
            check_dimensions(batch, self.dimension)?;

            let mut records = self.records.write().await;
            for doc in batch {
                let mut doc = doc.clone();
                if doc.id.is_empty() {
                    doc.id = Uuid::new_v4().to_string();
                }
                l2_normalise(&mut doc.vector);
                let id = doc.id.clone();
                records.insert(id.clone(), doc);

                processed += 1;
                if let Some(sender) = &progress {
                    let _ = sender.try_send(UpsertProgress {
                        id: id.clone(),
                        processed,
                        total,
                    });
                }
                report.statuses.push(UpsertStatus {
                    id,
                    outcome: UpsertOutcome::Stored,
                });
            }
        }

        Ok(report)
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<ScoredDocument>, MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::InvalidVector {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut query = vector.to_vec();
        l2_normalise(&mut query);

        let records = self.records.read().await;
        let mut results: Vec<ScoredDocument> = records
            .values()
            .filter(|doc| filter.is_none_or(|f| f.matches(doc)))
            .map(|doc| ScoredDocument {
                similarity: cosine_similarity(&query, &doc.vector),
                document: doc.clone(),
            })
            .collect();
        drop(records);

        rank_results(&mut results);
        results.truncate(k);
        Ok(results)
    }

    async fn get(&self, id: &str) -> Result<StoredDocument, MemoryError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        id: &str,
        content: String,
        vector: Vec<f32>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::InvalidVector {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound { id: id.to_string() })?;

        record.content_hash = crate::chunking::content_hash(&[&content]);
        record.content = content;
        record.vector = vector;
        l2_normalise(&mut record.vector);
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                record.metadata.insert(key, value);
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        records.remove(id);
        // Cascade to chunks pointing at the deleted original.
        records.retain(|_, doc| doc.original_id.as_deref() != Some(id));
        Ok(())
    }

    async fn query_documents(
        &self,
        filter: &DocumentFilter,
        page: PageRequest,
    ) -> Result<Page, MemoryError> {
        let records = self.records.read().await;
        let matched: Vec<StoredDocument> = records
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        drop(records);
        Ok(paginate(matched, page))
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.records.read().await.len())
    }

    async fn delete_all(&self) -> Result<(), MemoryError> {
        self.records.write().await.clear();
        Ok(())
    }
}
