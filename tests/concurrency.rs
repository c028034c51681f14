//! Concurrency and cancellation behaviour of the ingestion pipeline.
//!
//! The echo completer used here derives its extraction answer from the
//! prompt itself, so responses do not depend on the order in which
//! concurrent workers reach the completer. Reconciliation always falls back
//! to the default ADD (no scripted tool calls), which makes concurrent and
//! sequential runs comparable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memloom::config::EngineConfig;
use memloom::document::{Document, TextDocument};
use memloom::engine::MemoryEngine;
use memloom::error::MemoryError;
use memloom::fact::{KIND_FACT, META_KIND};
use memloom::providers::mock::MockEmbedder;
use memloom::providers::{Completer, Completion, ToolSpec};
use memloom::store::memory::MemoryVectorStore;
use memloom::store::{DocumentFilter, PageRequest, VectorStore};
use memloom::workers::Cancellation;

const DIM: usize = 48;

/// Completer whose extraction answer is a function of the prompt: the
/// document body becomes the single extracted fact. Tool-bearing calls
/// (reconciliation) get silence, which means default ADD.
struct EchoCompleter {
    delay: Duration,
}

impl EchoCompleter {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Completer for EchoCompleter {
    async fn complete(
        &self,
        _system: &str,
        user: &str,
        tools: &[ToolSpec],
    ) -> Result<Completion, MemoryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if !tools.is_empty() {
            return Ok(Completion::empty());
        }
        let body = user
            .split_once("==\n")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split_once("\n\n== Dates =="))
            .map(|(body, _)| body.trim())
            .unwrap_or_default();
        Ok(Completion::text(
            serde_json::to_string(&vec![body.to_string()]).expect("fact list serialises"),
        ))
    }
}

fn documents(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            Document::Text(
                TextDocument::new("misc", format!("primaryUser owns distinct item number {i}."))
                    .unwrap(),
            )
        })
        .collect()
}

async fn fact_contents(store: &MemoryVectorStore) -> Vec<String> {
    let page = store
        .query_documents(
            &DocumentFilter::new().with_metadata(META_KIND, KIND_FACT),
            PageRequest::new(100_000, 0),
        )
        .await
        .unwrap();
    let mut contents: Vec<String> = page.items.into_iter().map(|d| d.content).collect();
    contents.sort();
    contents
}

async fn run_ingestion(config: EngineConfig, count: usize) -> Vec<String> {
    let store = Arc::new(MemoryVectorStore::new(DIM));
    let engine = MemoryEngine::new(
        store.clone(),
        Arc::new(MockEmbedder::new(DIM)),
        Arc::new(EchoCompleter::new()),
        config,
    );
    let report = engine
        .store_documents(documents(count), None)
        .await
        .unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.succeeded, count);
    fact_contents(&store).await
}

// With independent facts, a concurrent run must converge to the same
// end-state as a sequential one (modulo server-assigned ids).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_run_matches_sequential_end_state() {
    const FACTS: usize = 1000;

    let concurrent = run_ingestion(
        EngineConfig::default()
            .with_workers_extract(4)
            .with_workers_reconcile(8),
        FACTS,
    )
    .await;
    let sequential = run_ingestion(
        EngineConfig::default()
            .with_workers_extract(1)
            .with_workers_reconcile(1),
        FACTS,
    )
    .await;

    assert_eq!(concurrent.len(), FACTS);
    assert_eq!(concurrent, sequential);
}

// Cancelling the ingestion scope closes the progress channel promptly and
// leaves the store with only fully-written records.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_closes_progress_and_keeps_store_consistent() {
    const DOCS: usize = 60;
    let reconcile_timeout = Duration::from_secs(5);

    let store = Arc::new(MemoryVectorStore::new(DIM));
    let engine = Arc::new(MemoryEngine::new(
        store.clone(),
        Arc::new(MockEmbedder::new(DIM)),
        Arc::new(EchoCompleter::with_delay(Duration::from_millis(20))),
        EngineConfig::default()
            .with_workers_extract(2)
            .with_workers_reconcile(2)
            .with_timeout_reconcile(reconcile_timeout),
    ));

    let cancellation = Cancellation::new();
    let scope = cancellation.scope();
    let (progress_tx, progress_rx) = flume::unbounded();

    let engine_ref = engine.clone();
    let ingestion = tokio::spawn(async move {
        engine_ref
            .store_documents_with_scope(documents(DOCS), Some(progress_tx), scope)
            .await
    });

    // Let the pipeline get going, then pull the plug.
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancellation.cancel();

    // The progress channel must close within one reconciliation timeout.
    let drained = tokio::time::timeout(reconcile_timeout, async {
        while progress_rx.recv_async().await.is_ok() {}
    })
    .await;
    assert!(
        drained.is_ok(),
        "progress channel must close within one job timeout of cancellation"
    );

    let report = tokio::time::timeout(reconcile_timeout, ingestion)
        .await
        .expect("ingestion must finish after cancellation")
        .expect("ingestion task must not panic")
        .expect("cancelled ingestion still returns a report");

    // Not everything can have gone through.
    assert!(
        report.succeeded < DOCS,
        "cancellation mid-batch must leave work undone (succeeded {})",
        report.succeeded
    );

    // Every fact that made it into the store is complete and readable.
    let facts = fact_contents(&store).await;
    assert_eq!(facts.len(), report.succeeded);
    for content in &facts {
        assert!(content.starts_with("primaryUser owns distinct item"));
    }
}

// The reconciliation queue is bounded: a batch much larger than the bound
// still completes because extraction blocks instead of overflowing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_does_not_lose_facts() {
    const DOCS: usize = 150;

    let contents = run_ingestion(
        EngineConfig::default()
            .with_workers_extract(4)
            .with_workers_reconcile(1),
        DOCS,
    )
    .await;
    assert_eq!(contents.len(), DOCS);
}
