//! Generic bounded-concurrency worker pool.
//!
//! A [`WorkerPool`] runs N consumers over a single bounded queue: jobs are
//! pulled as workers free up, each job runs under its own deadline, and all
//! outcomes stream to one result channel that closes exactly once, after the
//! queue is drained and every worker has exited. The pool never retries;
//! retry policy belongs to the caller.
//!
//! Cancellation flows through a [`CancelScope`] handle. Cancelling the
//! owning [`Cancellation`] discards queued jobs and fails in-flight jobs
//! with [`MemoryError::Cancelled`] at their next suspension point.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::MemoryError;

/// Owning side of a cancellation scope.
///
/// Dropping the handle without calling [`cancel`](Cancellation::cancel)
/// leaves derived scopes uncancelled forever.
#[derive(Debug)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Derives a scope observing this handle.
    #[must_use]
    pub fn scope(&self) -> CancelScope {
        CancelScope {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancels every scope derived from this handle.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of a cancellation scope, passed to every blocking
/// operation.
#[derive(Clone, Debug)]
pub struct CancelScope {
    rx: watch::Receiver<bool>,
}

impl CancelScope {
    /// Whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the scope is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // The owning handle is gone without firing; this scope can
                // never be cancelled any more.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Derives a child scope. Cancelling the parent cancels the child.
    #[must_use]
    pub fn child(&self) -> CancelScope {
        self.clone()
    }
}

/// Outcome of one job, echoing the job alongside its result.
#[derive(Debug)]
pub struct JobOutcome<J, T> {
    pub job: J,
    pub result: Result<T, MemoryError>,
}

/// Bounded-concurrency executor, generic over job and result types.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Creates a pool with the given worker count (clamped to at least 1).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes a fixed job list, returning the stream of outcomes.
    ///
    /// Jobs still queued when the scope is cancelled are discarded.
    pub fn process<J, T, F, Fut>(
        &self,
        jobs: Vec<J>,
        timeout: Duration,
        scope: CancelScope,
        handler: F,
    ) -> flume::Receiver<JobOutcome<J, T>>
    where
        J: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, MemoryError>> + Send + 'static,
    {
        let (job_tx, job_rx) = flume::bounded(self.workers * 2);
        let feeder_scope = scope.clone();
        tokio::spawn(async move {
            for job in jobs {
                tokio::select! {
                    _ = feeder_scope.cancelled() => break,
                    sent = job_tx.send_async(job) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.process_stream(job_rx, timeout, scope, handler)
    }

    /// Processes jobs arriving on a channel. The caller controls
    /// backpressure through the channel's bound; the outcome stream closes
    /// once the input channel is closed and drained.
    pub fn process_stream<J, T, F, Fut>(
        &self,
        jobs: flume::Receiver<J>,
        timeout: Duration,
        scope: CancelScope,
        handler: F,
    ) -> flume::Receiver<JobOutcome<J, T>>
    where
        J: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, MemoryError>> + Send + 'static,
    {
        let (result_tx, result_rx) = flume::bounded(self.workers * 2);

        for worker in 0..self.workers {
            let jobs = jobs.clone();
            let result_tx = result_tx.clone();
            let scope = scope.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = scope.cancelled() => break,
                        received = jobs.recv_async() => match received {
                            Ok(job) => job,
                            Err(_) => break,
                        },
                    };

                    // Biased so a job that finished in the same poll as a
                    // cancellation is still reported as completed; its store
                    // writes have already landed.
                    let result = tokio::select! {
                        biased;
                        outcome = tokio::time::timeout(timeout, handler(job.clone())) => {
                            match outcome {
                                Ok(result) => result,
                                Err(_) => Err(MemoryError::DeadlineExceeded { timeout }),
                            }
                        }
                        _ = scope.cancelled() => Err(MemoryError::Cancelled),
                    };

                    if result_tx
                        .send_async(JobOutcome { job, result })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tracing::trace!(worker, "worker exited");
            });
        }

        result_rx
    }
}
