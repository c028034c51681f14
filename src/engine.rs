//! Ingestion orchestrator and query surface.
//!
//! [`MemoryEngine`] drives the full pipeline: documents are persisted
//! (chunked when large), fanned out into per-speaker extraction jobs, and
//! every extracted fact is queued for reconciliation. Two bounded worker
//! pools run the LLM-heavy stages; the reconciliation queue's bound gives
//! natural backpressure, throttling extraction when reconciliation falls
//! behind.
//!
//! Progress streams to an optional channel as `{phase, processed, total}`
//! events; `total` grows as extraction discovers facts, and percentages are
//! computed against `max(total, processed)` so they never regress. The
//! channel closes exactly once, when ingestion finishes or is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::RngExt;

use crate::chunking::{needs_chunking, split_into_chunks};
use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::MemoryError;
use crate::extract::FactExtractor;
use crate::fact::MemoryFact;
use crate::providers::{Completer, Embedder};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::store::filter::META_SOURCE;
use crate::store::{
    DocumentFilter, Page, PageRequest, ScoredDocument, StoredDocument, VectorStore,
};
use crate::workers::{CancelScope, Cancellation, WorkerPool};

/// Pipeline phase a progress event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Extract,
    Reconcile,
}

/// Progress event streamed during ingestion.
///
/// Events are delivered best-effort: send a bounded channel that fills up
/// and events are dropped rather than stalling the pipeline. Use an
/// unbounded channel to observe every event.
#[derive(Clone, Copy, Debug)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub processed: usize,
    pub total: usize,
}

impl ProgressEvent {
    /// Completion percentage, monotone under a growing total.
    #[must_use]
    pub fn percent(&self) -> f32 {
        let denominator = self.total.max(self.processed);
        if denominator == 0 {
            0.0
        } else {
            (self.processed as f32 / denominator as f32) * 100.0
        }
    }
}

/// Aggregate result of one ingestion batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Facts whose reconciliation mutated the store (ADD/UPDATE/DELETE).
    pub succeeded: usize,
    /// Facts whose job failed (provider errors, deadlines).
    pub failed: usize,
    /// Facts suppressed as no-ops, plus facts discarded by cancellation.
    pub skipped: usize,
    /// First fatal store error, if the batch aborted mid-flight. Counts
    /// cover work completed up to that point.
    pub fatal: Option<MemoryError>,
}

/// Result of a similarity query: matched records plus a projection of their
/// content strings.
#[derive(Clone, Debug)]
pub struct QueryOutcome {
    pub snippets: Vec<String>,
    pub documents: Vec<ScoredDocument>,
}

#[derive(Clone)]
struct ExtractionJob {
    document: Arc<Document>,
    speaker: String,
}

/// The evolving memory engine.
///
/// All collaborators are injected at construction; the engine holds no
/// process-wide state and is safe to share behind an `Arc`. Read paths
/// ([`query`](MemoryEngine::query),
/// [`query_documents`](MemoryEngine::query_documents)) may run concurrently
/// with ingestion.
pub struct MemoryEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn Completer>,
    config: EngineConfig,
}

impl MemoryEngine {
    /// Creates an engine over the given collaborators.
    ///
    /// The embedder's dimension must match the store's; mismatched vectors
    /// fail with [`MemoryError::InvalidVector`] at write time.
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            completer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ingests a batch of documents. See
    /// [`store_documents_with_scope`](Self::store_documents_with_scope).
    pub async fn store_documents(
        &self,
        documents: Vec<Document>,
        progress: Option<flume::Sender<ProgressEvent>>,
    ) -> Result<IngestReport, MemoryError> {
        let cancellation = Cancellation::new();
        self.store_documents_with_scope(documents, progress, cancellation.scope())
            .await
    }

    /// Ingests a batch of documents under a cancellation scope.
    ///
    /// Per-fact failures are counted and do not stop the batch; a store
    /// failure aborts it (recorded in [`IngestReport::fatal`]). A schema
    /// that cannot be created fails immediately.
    pub async fn store_documents_with_scope(
        &self,
        documents: Vec<Document>,
        progress: Option<flume::Sender<ProgressEvent>>,
        scope: CancelScope,
    ) -> Result<IngestReport, MemoryError> {
        self.store.ensure_schema().await?;

        let mut report = IngestReport::default();

        // Persist originals and chunks so retrieval covers raw content too.
        for document in &documents {
            if scope.is_cancelled() {
                break;
            }
            if let Err(err) = self.persist_document(document).await {
                if err.is_fatal() {
                    report.fatal = Some(err);
                    return Ok(report);
                }
                tracing::warn!(
                    document_id = %document.id(),
                    error = %err,
                    "failed to persist document content, continuing with extraction"
                );
            }
        }

        // One extraction job per (document, speaker) pair.
        let jobs: Vec<ExtractionJob> = documents
            .into_iter()
            .map(Arc::new)
            .flat_map(|document| {
                document
                    .extraction_speakers()
                    .into_iter()
                    .map(move |speaker| ExtractionJob {
                        document: document.clone(),
                        speaker,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        let total_jobs = jobs.len();
        tracing::info!(jobs = total_jobs, "starting ingestion");

        let retry_max = self.config.retry_max;
        let retry_base = self.config.retry_base_delay;

        let extractor = Arc::new(FactExtractor::new(self.completer.clone()));
        let extract_pool = WorkerPool::new(self.config.workers_extract);
        let extract_rx = extract_pool.process(
            jobs,
            self.config.timeout_extract,
            scope.child(),
            move |job: ExtractionJob| {
                let extractor = extractor.clone();
                async move {
                    retry_transient(
                        || extractor.extract(&job.document, &job.speaker),
                        retry_max,
                        retry_base,
                    )
                    .await
                }
            },
        );

        // Bounded queue between the pools: extraction blocks on submission
        // when reconciliation is saturated.
        let (fact_tx, fact_rx) = flume::bounded::<MemoryFact>(self.config.workers_reconcile * 2);
        let reconciler = Arc::new(Reconciler::new(
            self.store.clone(),
            self.embedder.clone(),
            self.completer.clone(),
            self.config.neighbour_k,
            self.config.filter_neighbours_by_subject,
        ));
        let reconcile_pool = WorkerPool::new(self.config.workers_reconcile);
        let reconcile_rx = reconcile_pool.process_stream(
            fact_rx,
            self.config.timeout_reconcile,
            scope.child(),
            move |fact: MemoryFact| {
                let reconciler = reconciler.clone();
                async move {
                    retry_transient(|| reconciler.reconcile(&fact), retry_max, retry_base).await
                }
            },
        );

        // Forwarder: extraction outcomes → candidate facts → reconcile queue.
        let total_facts = Arc::new(AtomicUsize::new(0));
        let forwarder_totals = total_facts.clone();
        let forwarder_progress = progress.clone();
        let forwarder = tokio::spawn(async move {
            let mut processed = 0usize;
            let mut failed = 0usize;
            while let Ok(outcome) = extract_rx.recv_async().await {
                processed += 1;
                match outcome.result {
                    Ok(sentences) => {
                        for sentence in sentences {
                            let fact = candidate_from(&outcome.job, sentence);
                            forwarder_totals.fetch_add(1, Ordering::SeqCst);
                            if fact_tx.send_async(fact).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(MemoryError::MalformedModelOutput { detail }) => {
                        // Unusable output means no facts, not a failed job.
                        tracing::warn!(
                            document_id = %outcome.job.document.id(),
                            speaker = %outcome.job.speaker,
                            detail = %detail,
                            "unusable extraction output, no facts emitted"
                        );
                    }
                    Err(err) => {
                        failed += 1;
                        tracing::warn!(
                            document_id = %outcome.job.document.id(),
                            speaker = %outcome.job.speaker,
                            error = %err,
                            "extraction job failed"
                        );
                    }
                }
                if let Some(sender) = &forwarder_progress {
                    let _ = sender.try_send(ProgressEvent {
                        phase: Phase::Extract,
                        processed,
                        total: total_jobs,
                    });
                }
            }
            failed
        });

        // Aggregate reconciliation outcomes on the caller's task.
        let mut processed_facts = 0usize;
        while let Ok(outcome) = reconcile_rx.recv_async().await {
            processed_facts += 1;
            match outcome.result {
                Ok(ReconcileOutcome::Unchanged) => report.skipped += 1,
                Ok(_) => report.succeeded += 1,
                Err(MemoryError::Cancelled) => report.skipped += 1,
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "store failure, aborting ingestion batch");
                    report.fatal = Some(err);
                    break;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        fact = %outcome.job.content,
                        error = %err,
                        "reconciliation job failed"
                    );
                }
            }
            if let Some(sender) = &progress {
                let total = total_facts.load(Ordering::SeqCst).max(processed_facts);
                let _ = sender.try_send(ProgressEvent {
                    phase: Phase::Reconcile,
                    processed: processed_facts,
                    total,
                });
            }
        }
        drop(reconcile_rx);

        report.failed += forwarder.await.unwrap_or(0);

        // Facts discovered but never reconciled (cancellation, abort).
        let discovered = total_facts.load(Ordering::SeqCst);
        report.skipped += discovered.saturating_sub(processed_facts);

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Embeds and stores a document's content, chunking it when it exceeds
    /// the soft token limit.
    async fn persist_document(&self, document: &Document) -> Result<(), MemoryError> {
        let content = document.stored_content();

        let chunk_contents = if needs_chunking(&content, self.config.soft_token_limit) {
            split_into_chunks(&content, self.config.chunk_size, self.config.chunk_overlap)
        } else {
            Vec::new()
        };

        let mut texts = Vec::with_capacity(1 + chunk_contents.len());
        texts.push(content.clone());
        texts.extend(chunk_contents.iter().cloned());

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embed_batch_max) {
            vectors.extend(self.embedder.embed_batch(batch).await?);
        }
        let mut vectors = vectors.into_iter();

        let decorate = |mut record: StoredDocument| {
            record.tags = document.tags().clone();
            record.metadata.extend(document.metadata().clone());
            record
                .metadata
                .insert(META_SOURCE.to_string(), document.source().to_string());
            if let Some(timestamp) = document.timestamp() {
                record.timestamp = Some(timestamp);
            }
            record
        };

        let mut records = Vec::with_capacity(1 + chunk_contents.len());
        let original = StoredDocument::original(content, vectors.next().unwrap_or_default())
            .with_id(document.id());
        records.push(decorate(original));
        for (number, chunk_content) in chunk_contents.into_iter().enumerate() {
            let chunk = StoredDocument::chunk(
                document.id(),
                number as u32,
                chunk_content,
                vectors.next().unwrap_or_default(),
            );
            records.push(decorate(chunk));
        }

        let chunk_count = records.len() - 1;
        let mut failed = 0usize;
        for batch in records.chunks(self.config.upsert_batch_max) {
            let upsert_report = self.store.upsert(batch.to_vec(), None).await?;
            failed += upsert_report.failed();
        }
        if failed > 0 {
            tracing::warn!(
                document_id = %document.id(),
                failed,
                "some document records failed to persist"
            );
        }
        tracing::debug!(
            document_id = %document.id(),
            chunks = chunk_count,
            "document persisted"
        );
        Ok(())
    }

    /// Similarity query: embeds `text` and returns the top-`k` records with
    /// their content snippets.
    pub async fn query(&self, text: &str, k: usize) -> Result<QueryOutcome, MemoryError> {
        let vector = self.embedder.embed(text).await?;
        let documents = self.store.query_by_vector(&vector, k, None).await?;
        let snippets = documents
            .iter()
            .map(|d| d.document.content.clone())
            .collect();
        Ok(QueryOutcome {
            snippets,
            documents,
        })
    }

    /// Structured browse over the store.
    pub async fn query_documents(
        &self,
        filter: &DocumentFilter,
        page: PageRequest,
    ) -> Result<Page, MemoryError> {
        self.store.query_documents(filter, page).await
    }

    /// Removes a record (and its chunks). Idempotent.
    pub async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        self.store.delete(id).await
    }

    /// Drops every record. Intended for tests.
    pub async fn delete_all(&self) -> Result<(), MemoryError> {
        self.store.delete_all().await
    }
}

fn candidate_from(job: &ExtractionJob, sentence: String) -> MemoryFact {
    let mut fact = MemoryFact::candidate(
        sentence,
        job.speaker.clone(),
        job.document.id(),
        job.document.source(),
    );
    fact.timestamp = job.document.timestamp().or_else(|| Some(Utc::now()));
    fact
}

/// Retries an operation on transient provider failures with exponential
/// backoff and jitter. Everything else fails immediately.
pub(crate) async fn retry_transient<T, F, Fut>(
    mut operation: F,
    retries: u32,
    base_delay: Duration,
) -> Result<T, MemoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MemoryError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                let backoff = base_delay.saturating_mul(1 << (attempt - 1));
                let jitter_cap = (backoff.as_millis() as u64 / 4).max(1);
                let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_cap));
                tracing::debug!(
                    attempt,
                    delay_ms = (backoff + jitter).as_millis() as u64,
                    error = %err,
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(backoff + jitter).await;
            }
            Err(err) => return Err(err),
        }
    }
}
