//! Background sampling of live traffic.
//!
//! A fraction of recorded interactions is handed to a bounded queue and
//! evaluated by a fixed pool of workers after the response has been
//! returned. Submission never blocks: when the queue is full the job is
//! dropped with a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SamplingConfig;
use crate::error::Result;
use crate::evaluator::{EvaluateQueryRequest, Evaluator};

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingJob {
    pub query_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl SamplingJob {
    pub fn new(query_id: Uuid) -> Self {
        Self {
            query_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Consumer of sampled jobs.
#[async_trait]
pub trait SampleHandler: Send + Sync {
    async fn handle(&self, job: SamplingJob) -> Result<()>;
}

#[async_trait]
impl SampleHandler for Evaluator {
    async fn handle(&self, job: SamplingJob) -> Result<()> {
        self.evaluate_query(&EvaluateQueryRequest::new(job.query_id))
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Not selected by the sampling rate.
    Skipped,
    /// Selected, but the queue was full or closed.
    Dropped,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Skipped => "skipped",
            Self::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Default)]
pub struct SamplingStats {
    pub queued: AtomicUsize,
    pub dropped: AtomicUsize,
    pub processed: AtomicUsize,
    pub failed: AtomicUsize,
}

pub struct SamplingQueue {
    tx: Mutex<Option<mpsc::Sender<SamplingJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rate: f64,
    enabled: bool,
    stats: Arc<SamplingStats>,
}

impl SamplingQueue {
    /// Create the queue and spawn its workers on the current runtime.
    pub fn start(config: &SamplingConfig, handler: Arc<dyn SampleHandler>) -> Self {
        let (tx, rx) = mpsc::channel::<SamplingJob>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(SamplingStats::default());

        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        let query_id = job.query_id;
                        let handler = Arc::clone(&handler);
                        // Run each job in its own task so a panic stays contained.
                        match tokio::spawn(async move { handler.handle(job).await }).await {
                            Ok(Ok(())) => {
                                stats.processed.fetch_add(1, Ordering::Relaxed);
                                debug!(worker, query_id = %query_id, "Sampled evaluation finished");
                            }
                            Ok(Err(e)) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(worker, query_id = %query_id, kind = e.kind(), error = %e, "Sampled evaluation failed");
                            }
                            Err(e) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                error!(worker, query_id = %query_id, error = %e, "Sampled evaluation task panicked");
                            }
                        }
                    }
                    debug!(worker, "Sampling worker stopped");
                })
            })
            .collect();

        info!(rate = config.rate, workers = config.workers, "Background sampling started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            rate: config.rate.clamp(0.0, 1.0),
            enabled: config.enabled,
            stats,
        }
    }

    fn selected(&self) -> bool {
        if !self.enabled || self.rate <= 0.0 {
            return false;
        }
        self.rate >= 1.0 || rand::random::<f64>() < self.rate
    }

    /// Submit `query_id` for evaluation if selected by the sampling rate.
    pub fn maybe_submit(&self, query_id: Uuid) -> SubmitOutcome {
        if !self.selected() {
            return SubmitOutcome::Skipped;
        }
        self.submit(SamplingJob::new(query_id))
    }

    /// Enqueue unconditionally, without waiting for capacity.
    pub fn submit(&self, job: SamplingJob) -> SubmitOutcome {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Dropped;
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(query_id = %job.query_id, "Sampling queue full, dropping job");
                SubmitOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(query_id = %job.query_id, "Sampling queue closed, dropping job");
                SubmitOutcome::Dropped
            }
        }
    }

    pub fn stats(&self) -> &SamplingStats {
        &self.stats
    }

    /// Close the queue and wait for queued jobs to drain.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Sampling worker exited abnormally");
            }
        }
        info!(
            processed = self.stats.processed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            dropped = self.stats.dropped.load(Ordering::Relaxed),
            "Background sampling stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RaglensError, ValidationError};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Uuid>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SampleHandler for Recorder {
        async fn handle(&self, job: SamplingJob) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(job.query_id);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl SampleHandler for Failing {
        async fn handle(&self, job: SamplingJob) -> Result<()> {
            Err(RaglensError::from(ValidationError::not_found("Query", job.query_id)))
        }
    }

    struct Panicking;

    #[async_trait]
    impl SampleHandler for Panicking {
        async fn handle(&self, _job: SamplingJob) -> Result<()> {
            panic!("handler bug");
        }
    }

    fn config(rate: f64, capacity: usize, workers: usize) -> SamplingConfig {
        SamplingConfig {
            enabled: true,
            rate,
            queue_capacity: capacity,
            workers,
        }
    }

    #[tokio::test]
    async fn test_all_jobs_processed_at_full_rate() {
        let recorder = Arc::new(Recorder::default());
        let queue = SamplingQueue::start(&config(1.0, 16, 2), recorder.clone());
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert_eq!(queue.maybe_submit(*id), SubmitOutcome::Queued);
        }
        queue.shutdown().await;

        let mut seen = recorder.seen.lock().unwrap().clone();
        let mut expected = ids.clone();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(queue.stats().processed.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_zero_rate_and_disabled_skip() {
        let recorder = Arc::new(Recorder::default());
        let queue = SamplingQueue::start(&config(0.0, 4, 1), recorder.clone());
        assert_eq!(queue.maybe_submit(Uuid::new_v4()), SubmitOutcome::Skipped);

        let mut disabled = config(1.0, 4, 1);
        disabled.enabled = false;
        let off = SamplingQueue::start(&disabled, recorder.clone());
        assert_eq!(off.maybe_submit(Uuid::new_v4()), SubmitOutcome::Skipped);

        queue.shutdown().await;
        off.shutdown().await;
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let queue = SamplingQueue::start(&config(1.0, 1, 1), recorder);
        let outcomes: Vec<SubmitOutcome> = (0..10).map(|_| queue.maybe_submit(Uuid::new_v4())).collect();
        assert!(outcomes.contains(&SubmitOutcome::Dropped));
        assert!(queue.stats().dropped.load(Ordering::Relaxed) > 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_stay_in_workers() {
        let failing = SamplingQueue::start(&config(1.0, 4, 1), Arc::new(Failing));
        failing.maybe_submit(Uuid::new_v4());
        failing.shutdown().await;
        assert_eq!(failing.stats().failed.load(Ordering::Relaxed), 1);

        let panicking = SamplingQueue::start(&config(1.0, 4, 1), Arc::new(Panicking));
        panicking.maybe_submit(Uuid::new_v4());
        panicking.maybe_submit(Uuid::new_v4());
        panicking.shutdown().await;
        assert_eq!(panicking.stats().failed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let queue = SamplingQueue::start(&config(1.0, 4, 1), Arc::new(Recorder::default()));
        queue.shutdown().await;
        assert_eq!(queue.submit(SamplingJob::new(Uuid::new_v4())), SubmitOutcome::Dropped);
    }
}
