//! Engine configuration.
//!
//! All tunables live in a single [`EngineConfig`] value object that is passed
//! to the engine at construction. Unset fields fall back to the documented
//! defaults; the core never reads the environment.

use std::time::Duration;

/// Configuration for [`MemoryEngine`](crate::engine::MemoryEngine).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use memloom::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_workers_extract(2)
///     .with_neighbour_k(8)
///     .with_timeout_reconcile(Duration::from_secs(30));
/// assert_eq!(config.workers_extract, 2);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Concurrency of the extraction worker pool.
    pub workers_extract: usize,
    /// Concurrency of the reconciliation worker pool.
    pub workers_reconcile: usize,
    /// Neighbours fetched from the store per reconciliation decision.
    pub neighbour_k: usize,
    /// Per-job deadline for extraction jobs.
    pub timeout_extract: Duration,
    /// Per-job deadline for reconciliation jobs.
    pub timeout_reconcile: Duration,
    /// Soft limit (in estimated tokens, 4 chars/token) above which a
    /// document's content is chunked.
    pub soft_token_limit: usize,
    /// Chunk window size in characters.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    pub chunk_overlap: usize,
    /// Maximum number of texts per embedding batch call.
    pub embed_batch_max: usize,
    /// Maximum number of records per upsert flush.
    pub upsert_batch_max: usize,
    /// Whether the reconciliation neighbour query is filtered by the
    /// candidate fact's subject, in addition to similarity.
    pub filter_neighbours_by_subject: bool,
    /// Retries for transient provider failures inside a job.
    pub retry_max: u32,
    /// Base delay for the exponential retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers_extract: 4,
            workers_reconcile: 8,
            neighbour_k: 5,
            timeout_extract: Duration::from_secs(120),
            timeout_reconcile: Duration::from_secs(60),
            soft_token_limit: 2000,
            chunk_size: 1500,
            chunk_overlap: 150,
            embed_batch_max: 64,
            upsert_batch_max: 100,
            filter_neighbours_by_subject: true,
            retry_max: 2,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Sets the extraction pool concurrency (clamped to at least 1).
    #[must_use]
    pub fn with_workers_extract(mut self, workers: usize) -> Self {
        self.workers_extract = workers.max(1);
        self
    }

    /// Sets the reconciliation pool concurrency (clamped to at least 1).
    #[must_use]
    pub fn with_workers_reconcile(mut self, workers: usize) -> Self {
        self.workers_reconcile = workers.max(1);
        self
    }

    /// Sets how many neighbours each reconciliation decision sees.
    #[must_use]
    pub fn with_neighbour_k(mut self, k: usize) -> Self {
        self.neighbour_k = k.max(1);
        self
    }

    /// Sets the per-job extraction deadline.
    #[must_use]
    pub fn with_timeout_extract(mut self, timeout: Duration) -> Self {
        self.timeout_extract = timeout;
        self
    }

    /// Sets the per-job reconciliation deadline.
    #[must_use]
    pub fn with_timeout_reconcile(mut self, timeout: Duration) -> Self {
        self.timeout_reconcile = timeout;
        self
    }

    /// Sets the chunking parameters (window and overlap, in characters).
    ///
    /// The overlap is clamped below the window so chunking always makes
    /// forward progress.
    #[must_use]
    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_overlap = overlap.min(self.chunk_size.saturating_sub(1));
        self
    }

    /// Sets the soft token limit above which content is chunked.
    #[must_use]
    pub fn with_soft_token_limit(mut self, limit: usize) -> Self {
        self.soft_token_limit = limit.max(1);
        self
    }

    /// Sets the embedding batch ceiling.
    #[must_use]
    pub fn with_embed_batch_max(mut self, max: usize) -> Self {
        self.embed_batch_max = max.max(1);
        self
    }

    /// Sets the upsert batch ceiling.
    #[must_use]
    pub fn with_upsert_batch_max(mut self, max: usize) -> Self {
        self.upsert_batch_max = max.max(1);
        self
    }

    /// Toggles subject filtering on the reconciliation neighbour query.
    #[must_use]
    pub fn with_filter_neighbours_by_subject(mut self, filter: bool) -> Self {
        self.filter_neighbours_by_subject = filter;
        self
    }
}
