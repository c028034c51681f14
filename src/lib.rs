//! memloom — an evolving memory engine.
//!
//! memloom turns heterogeneous conversational and textual artifacts into a
//! persistent, queryable set of atomic facts about a single primary user.
//! Each document is distilled into fact sentences by a completion model;
//! each candidate fact is reconciled against its semantic neighbours through
//! an LLM tool decision (`ADD` / `UPDATE` / `DELETE` / `NONE`); the result
//! lives in a vector-indexed store with similarity search and structured
//! filtering.
//!
//! ```text
//! Parser (external) ──► Document ──► MemoryEngine::store_documents
//!                                         │
//!                     ┌───────────────────┤
//!                     ▼                   ▼
//!             chunk + upsert       extraction pool ──► fact sentences
//!             (vector store)              │
//!                                         ▼   bounded queue (backpressure)
//!                                 reconciliation pool
//!                                         │   neighbours + tool decision
//!                                         ▼
//!                                  vector store (facts)
//!                                         │
//!                        query(text) / query_documents(filter)
//! ```
//!
//! # Modules
//!
//! - [`document`] — canonical text/conversation documents and speaker
//!   normalisation.
//! - [`chunking`] — overlapping-window content splitting and hashing.
//! - [`store`] — the vector store contract, filter DSL, and the in-memory
//!   and SQLite backends.
//! - [`fact`] — the memory fact model and its store projection.
//! - [`providers`] — embedder/completer traits, deterministic mocks, and
//!   (behind the `openai` feature) OpenAI-compatible implementations.
//! - [`extract`] — LLM fact extraction.
//! - [`reconcile`] — the ADD/UPDATE/DELETE/NONE decision engine.
//! - [`workers`] — the bounded worker pool and cancellation scopes.
//! - [`engine`] — the ingestion orchestrator and query surface.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use memloom::config::EngineConfig;
//! use memloom::document::{ConversationDocument, Document, Message};
//! use memloom::engine::MemoryEngine;
//! use memloom::providers::mock::{MockEmbedder, ScriptedCompleter};
//! use memloom::providers::Completion;
//! use memloom::store::memory::MemoryVectorStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), memloom::error::MemoryError> {
//! let embedder = Arc::new(MockEmbedder::new(64));
//! let completer = Arc::new(ScriptedCompleter::new());
//! completer.push(Completion::text(r#"["primaryUser drinks coffee at 7am."]"#));
//!
//! let store = Arc::new(MemoryVectorStore::new(64));
//! let engine = MemoryEngine::new(store, embedder, completer, EngineConfig::default());
//!
//! let doc = ConversationDocument::builder("whatsapp", "alice@example.com")
//!     .person("bob@example.com")
//!     .message(Message::new("alice@example.com", "I drink coffee at 7am."))
//!     .message(Message::new("bob@example.com", "Nice."))
//!     .build()?;
//!
//! let report = engine
//!     .store_documents(vec![Document::Conversation(doc)], None)
//!     .await?;
//! assert_eq!(report.failed, 0);
//!
//! let outcome = engine.query("coffee", 5).await?;
//! assert!(!outcome.snippets.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fact;
pub mod providers;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod workers;

pub use config::EngineConfig;
pub use document::{ConversationDocument, Document, Message, PRIMARY_USER, TextDocument};
pub use engine::{IngestReport, MemoryEngine, Phase, ProgressEvent, QueryOutcome};
pub use error::MemoryError;
pub use fact::{MemoryFact, Sensitivity};
pub use store::{DocumentFilter, DocumentType, Page, PageRequest, StoredDocument, VectorStore};
pub use workers::{CancelScope, Cancellation, WorkerPool};
