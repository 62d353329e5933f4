//! Per-shard batching worker.
//!
//! A [`ShardWorker`] drains one shard queue into a pending batch and flushes
//! it when it reaches `max_samples_per_send` or when the batch deadline
//! elapses, whichever comes first.
//!
//! ```text
//!   RUNNING ──input closed──▶ DRAINING ──queue empty──▶ STOPPED
//!      │                                                   ▲
//!      └──────────────────cancelled────────────────────────┘
//! ```
//!
//! A flush runs the whole retry sequence before the worker reads its queue
//! again. While a remote sink keeps failing, the shard queue fills up and new
//! samples are dropped at [`QueueManager::append`](crate::queue::QueueManager::append).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::client::{Outcome, RemoteStorage};
use crate::error::SendError;
use crate::gate::RejectGate;
use crate::queue::{QueueConfig, QueueStats};
use crate::sample::Sample;

/// Drains one shard queue into batches and sends them.
#[derive(Debug)]
pub struct ShardWorker<S> {
    index: usize,
    rx: mpsc::Receiver<Sample>,
    storage: Arc<S>,
    gate: Arc<RejectGate>,
    stats: Arc<QueueStats>,
    cancel: CancellationToken,
    max_samples_per_send: usize,
    batch_send_deadline: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    pending: Vec<Sample>,
    draining: bool,
}

impl<S: RemoteStorage> ShardWorker<S> {
    /// Creates a worker for shard `index` reading from `rx`.
    pub fn new(
        index: usize,
        rx: mpsc::Receiver<Sample>,
        config: &QueueConfig,
        storage: Arc<S>,
        gate: Arc<RejectGate>,
        stats: Arc<QueueStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            rx,
            storage,
            gate,
            stats,
            cancel,
            max_samples_per_send: config.max_samples_per_send,
            batch_send_deadline: config.batch_send_deadline,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            pending: Vec::with_capacity(config.max_samples_per_send),
            draining: false,
        }
    }

    /// Runs until the input is closed and drained, or until cancelled.
    pub async fn run(mut self) {
        debug!(shard = self.index, "shard worker started");

        let deadline = tokio::time::sleep(self.batch_send_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.discard_pending("shard worker cancelled");
                    break;
                }

                () = &mut deadline => {
                    if !self.pending.is_empty() {
                        trace!(shard = self.index, samples = self.pending.len(), "batch deadline elapsed");
                        if !self.flush().await {
                            break;
                        }
                    }
                    deadline.as_mut().reset(Instant::now() + self.batch_send_deadline);
                }

                received = self.rx.recv() => match received {
                    Some(sample) => {
                        if !self.draining && self.rx.is_closed() {
                            self.draining = true;
                            debug!(shard = self.index, queued = self.rx.len(), "shard input closed, draining");
                        }
                        self.pending.push(sample);
                        if self.pending.len() >= self.max_samples_per_send {
                            if !self.flush().await {
                                break;
                            }
                            deadline.as_mut().reset(Instant::now() + self.batch_send_deadline);
                        }
                    }
                    None => {
                        if !self.pending.is_empty() {
                            self.flush().await;
                        }
                        break;
                    }
                },
            }
        }

        debug!(shard = self.index, "shard worker stopped");
    }

    /// Sends the pending batch and clears it.
    ///
    /// Returns false if the worker was cancelled mid-flush.
    async fn flush(&mut self) -> bool {
        let completed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = self.send_with_retry(&self.pending) => true,
        };

        if completed {
            self.pending.clear();
        } else {
            self.discard_pending("shard worker cancelled during flush");
        }
        completed
    }

    /// Sends one batch, retrying recoverable failures up to `max_retries`
    /// attempts with doubling backoff.
    async fn send_with_retry(&self, batch: &[Sample]) {
        let mut backoff = self.retry_backoff;

        for attempt in 1..=self.max_retries {
            if !self.gate.is_open() {
                self.stats.record_failed(batch.len());
                warn!(
                    shard = self.index,
                    samples = batch.len(),
                    "sending suspended after identity rejection, discarding batch"
                );
                return;
            }

            let err = match self.storage.store(batch).await {
                Ok(()) => {
                    self.stats.record_sent(batch.len());
                    debug!(shard = self.index, samples = batch.len(), attempt, "batch sent");
                    return;
                }
                Err(err) => err,
            };

            match err.outcome() {
                Outcome::Recoverable if attempt < self.max_retries => {
                    warn!(
                        shard = self.index,
                        samples = batch.len(),
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        error = %err,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Outcome::Recoverable => {
                    self.stats.record_failed(batch.len());
                    error!(
                        shard = self.index,
                        samples = batch.len(),
                        attempt,
                        error = %err,
                        "send failed, retries exhausted, dropping batch"
                    );
                    return;
                }
                Outcome::FatalReject => {
                    self.stats.record_failed(batch.len());
                    let message = match &err {
                        SendError::IdentityRejected { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    self.gate.trip(&message);
                    return;
                }
                Outcome::NonRecoverable | Outcome::Success => {
                    self.stats.record_failed(batch.len());
                    warn!(
                        shard = self.index,
                        samples = batch.len(),
                        error = %err,
                        "batch refused, dropping"
                    );
                    return;
                }
            }
        }
    }

    fn discard_pending(&mut self, reason: &str) {
        if !self.pending.is_empty() {
            self.stats.record_failed(self.pending.len());
            warn!(shard = self.index, samples = self.pending.len(), "{reason}, discarding batch");
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gate::RejectPolicy;
    use crate::sample::LabelSet;

    /// Replies with a fixed script of results, then succeeds.
    struct Scripted {
        replies: Mutex<Vec<Result<(), SendError>>>,
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<Sample>>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<(), SendError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteStorage for Scripted {
        async fn store(&self, batch: &[Sample]) -> Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(batch.to_vec());
            self.replies.lock().unwrap().pop().unwrap_or(Ok(()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn server_error() -> Result<(), SendError> {
        Err(SendError::ServerStatus {
            status: 500,
            body: String::new(),
        })
    }

    fn bad_request() -> Result<(), SendError> {
        Err(SendError::BatchRejected {
            status: 400,
            body: String::new(),
        })
    }

    fn rejected() -> Result<(), SendError> {
        Err(SendError::IdentityRejected {
            status: 403,
            message: "source disabled".to_string(),
        })
    }

    fn sample(i: i64) -> Sample {
        let labels: LabelSet = [("__name__", "up"), ("i", &i.to_string())]
            .into_iter()
            .collect();
        Sample::new(labels, i, 1.0).unwrap()
    }

    fn worker(
        storage: Arc<Scripted>,
        gate: Arc<RejectGate>,
        config: &QueueConfig,
    ) -> (ShardWorker<Scripted>, mpsc::Sender<Sample>, Arc<QueueStats>) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let stats = Arc::new(QueueStats::default());
        let worker = ShardWorker::new(
            0,
            rx,
            config,
            storage,
            gate,
            Arc::clone(&stats),
            CancellationToken::new(),
        );
        (worker, tx, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_recoverable_then_succeeds() {
        let storage = Scripted::new(vec![server_error(), server_error()]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let (worker, _tx, stats) = worker(Arc::clone(&storage), gate, &QueueConfig::default());

        worker.send_with_retry(&[sample(1)]).await;

        assert_eq!(storage.calls(), 3);
        assert_eq!(stats.sent_batches(), 1);
        assert_eq!(stats.failed_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_drops_batch() {
        let storage = Scripted::new(vec![server_error(), server_error(), server_error(), server_error()]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let (worker, _tx, stats) = worker(Arc::clone(&storage), gate, &QueueConfig::default());

        worker.send_with_retry(&[sample(1), sample(2)]).await;

        assert_eq!(storage.calls(), 3);
        assert_eq!(stats.sent_batches(), 0);
        assert_eq!(stats.failed_batches(), 1);
        assert_eq!(stats.failed_samples(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_recoverable_is_not_retried() {
        let storage = Scripted::new(vec![bad_request()]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let (worker, _tx, stats) = worker(Arc::clone(&storage), gate, &QueueConfig::default());

        worker.send_with_retry(&[sample(1)]).await;

        assert_eq!(storage.calls(), 1);
        assert_eq!(stats.failed_batches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_trips_gate_and_stops_sending() {
        let storage = Scripted::new(vec![rejected()]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let (worker, _tx, stats) =
            worker(Arc::clone(&storage), Arc::clone(&gate), &QueueConfig::default());

        worker.send_with_retry(&[sample(1)]).await;
        assert!(gate.is_halted());
        assert_eq!(gate.message().as_deref(), Some("source disabled"));

        worker.send_with_retry(&[sample(2)]).await;
        assert_eq!(storage.calls(), 1);
        assert_eq!(stats.failed_batches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_partial_batch_when_input_closes() {
        let storage = Scripted::new(vec![]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let (worker, tx, stats) = worker(Arc::clone(&storage), gate, &QueueConfig::default());

        for i in 0..3 {
            tx.try_send(sample(i)).unwrap();
        }
        drop(tx);
        worker.run().await;

        assert_eq!(storage.calls(), 1);
        assert_eq!(stats.sent_samples(), 3);
        let batches = storage.batches.lock().unwrap();
        let timestamps: Vec<i64> = batches[0].iter().map(Sample::timestamp).collect();
        assert_eq!(timestamps, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending() {
        let storage = Scripted::new(vec![]);
        let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
        let config = QueueConfig::default();
        let (tx, rx) = mpsc::channel(config.capacity);
        let stats = Arc::new(QueueStats::default());
        let cancel = CancellationToken::new();
        let worker = ShardWorker::new(
            0,
            rx,
            &config,
            Arc::clone(&storage),
            gate,
            Arc::clone(&stats),
            cancel.clone(),
        );

        tx.try_send(sample(1)).unwrap();
        let handle = tokio::spawn(worker.run());
        while tx.capacity() < tx.max_capacity() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(storage.calls(), 0);
        assert_eq!(stats.failed_samples(), 1);
    }
}
