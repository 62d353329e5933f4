//! Sharded outbound queue.
//!
//! The [`QueueManager`] owns a fixed number of shards. Each shard is a
//! bounded FIFO drained by one [`ShardWorker`](crate::shard::ShardWorker).
//! Samples are routed by `fingerprint % shards`, so every sample of a series
//! lands on the same shard and is sent in arrival order.
//!
//! # Backpressure
//!
//! [`QueueManager::append`] never blocks. When the target shard is full the
//! sample is dropped and [`QueueStats::dropped`] goes up by one. A slow or
//! failing remote sink therefore shows up as drops, not as memory growth.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use corsair::client::SigningClient;
//! use corsair::gate::{RejectGate, RejectPolicy};
//! use corsair::queue::{QueueConfig, QueueManager};
//!
//! # async fn example(client: SigningClient) -> Result<(), Box<dyn std::error::Error>> {
//! let gate = Arc::new(RejectGate::new(RejectPolicy::Halt));
//! let queue = QueueManager::new(
//!     QueueConfig::default(),
//!     Duration::from_secs(60),
//!     Arc::new(client),
//!     gate,
//! )?;
//!
//! queue.start();
//! // ... queue.append(sample) from the scrape loop ...
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RemoteStorage;
use crate::config::duration_ms;
use crate::error::ConfigError;
use crate::gate::RejectGate;
use crate::sample::Sample;
use crate::shard::ShardWorker;

/// Queue and batching parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of each shard's queue, in samples.
    pub capacity: usize,
    /// Flush a batch as soon as it holds this many samples.
    pub max_samples_per_send: usize,
    /// Flush a non-empty batch after this long without a size-triggered flush.
    #[serde(with = "duration_ms")]
    pub batch_send_deadline: Duration,
    /// Send attempts per batch, including the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Number of shards.
    pub shards: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_samples_per_send: 100,
            batch_send_deadline: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            shards: 1,
        }
    }
}

impl QueueConfig {
    /// Checks that every parameter is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field| ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        };

        if self.shards == 0 {
            return Err(zero("queue.shards"));
        }
        if self.capacity == 0 {
            return Err(zero("queue.capacity"));
        }
        if self.max_samples_per_send == 0 {
            return Err(zero("queue.max_samples_per_send"));
        }
        if self.max_retries == 0 {
            return Err(zero("queue.max_retries"));
        }
        if self.batch_send_deadline.is_zero() {
            return Err(zero("queue.batch_send_deadline"));
        }
        Ok(())
    }
}

/// Counters shared by the queue manager and its shard workers.
///
/// All counters are monotonic and never reset.
#[derive(Debug, Default)]
pub struct QueueStats {
    dropped: AtomicU64,
    sent_batches: AtomicU64,
    sent_samples: AtomicU64,
    failed_batches: AtomicU64,
    failed_samples: AtomicU64,
}

impl QueueStats {
    /// Samples refused by [`QueueManager::append`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Batches accepted by the remote sink.
    pub fn sent_batches(&self) -> u64 {
        self.sent_batches.load(Ordering::Relaxed)
    }

    /// Samples accepted by the remote sink.
    pub fn sent_samples(&self) -> u64 {
        self.sent_samples.load(Ordering::Relaxed)
    }

    /// Batches given up on: refused, out of retries, or discarded while
    /// sending was suspended.
    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Samples in the batches counted by [`failed_batches`](Self::failed_batches).
    pub fn failed_samples(&self) -> u64 {
        self.failed_samples.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, samples: usize) {
        self.sent_batches.fetch_add(1, Ordering::Relaxed);
        self.sent_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, samples: usize) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.failed_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }
}

/// Owns the shards and supervises their workers.
///
/// All methods take `&self`; the manager is meant to be shared behind an
/// [`Arc`] between the scrape loop and whoever calls [`stop`](Self::stop).
#[derive(Debug)]
pub struct QueueManager<S> {
    config: QueueConfig,
    flush_deadline: Duration,
    storage: Arc<S>,
    gate: Arc<RejectGate>,
    stats: Arc<QueueStats>,
    senders: RwLock<Vec<mpsc::Sender<Sample>>>,
    receivers: Mutex<Vec<mpsc::Receiver<Sample>>>,
    workers: Mutex<Option<JoinSet<()>>>,
    cancel: CancellationToken,
}

impl<S: RemoteStorage> QueueManager<S> {
    /// Creates the shards. Workers are not running until [`start`](Self::start).
    ///
    /// Samples appended before `start` are buffered, subject to capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(
        config: QueueConfig,
        flush_deadline: Duration,
        storage: Arc<S>,
        gate: Arc<RejectGate>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..config.shards)
            .map(|_| mpsc::channel(config.capacity))
            .unzip();

        Ok(Self {
            config,
            flush_deadline,
            storage,
            gate,
            stats: Arc::new(QueueStats::default()),
            senders: RwLock::new(senders),
            receivers: Mutex::new(receivers),
            workers: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Routes `sample` to its shard without blocking.
    ///
    /// Returns false, and counts a drop, if the shard is full or the queue
    /// has been stopped.
    pub fn append(&self, sample: Sample) -> bool {
        let Ok(senders) = self.senders.read() else {
            self.stats.record_dropped();
            return false;
        };
        if senders.is_empty() {
            self.stats.record_dropped();
            return false;
        }

        let shard = shard_index(sample.fingerprint(), senders.len());
        match senders[shard].try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                debug!(shard, dropped = self.stats.dropped(), "shard full, dropping sample");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.record_dropped();
                false
            }
        }
    }

    /// Spawns one worker per shard on the current tokio runtime.
    ///
    /// Calling `start` more than once has no further effect.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) {
        let receivers = match self.receivers.lock() {
            Ok(mut receivers) => std::mem::take(&mut *receivers),
            Err(_) => return,
        };
        if receivers.is_empty() {
            return;
        }

        let mut workers = JoinSet::new();
        for (index, rx) in receivers.into_iter().enumerate() {
            let worker = ShardWorker::new(
                index,
                rx,
                &self.config,
                Arc::clone(&self.storage),
                Arc::clone(&self.gate),
                Arc::clone(&self.stats),
                self.cancel.child_token(),
            );
            workers.spawn(worker.run());
        }

        info!(
            shards = self.config.shards,
            capacity = self.config.capacity,
            remote = self.storage.name(),
            "queue manager started"
        );
        if let Ok(mut slot) = self.workers.lock() {
            *slot = Some(workers);
        }
    }

    /// Stops the queue.
    ///
    /// Closes every shard's input, then waits up to the flush deadline for
    /// the workers to drain their queues and flush their last batches. Any
    /// worker still running after the deadline is cancelled, losing whatever
    /// it held. Returns once every worker has exited.
    pub async fn stop(&self) {
        if let Ok(mut senders) = self.senders.write() {
            senders.clear();
        }
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.clear();
        }

        let Some(mut workers) = self.workers.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };

        let drained =
            tokio::time::timeout(self.flush_deadline, join_all(&mut workers)).await;
        if drained.is_err() {
            warn!(
                deadline_ms = self.flush_deadline.as_millis(),
                remaining = workers.len(),
                "flush deadline exceeded, cancelling shard workers"
            );
            self.cancel.cancel();
            join_all(&mut workers).await;
        }

        info!(
            sent = self.stats.sent_samples(),
            failed = self.stats.failed_samples(),
            dropped = self.stats.dropped(),
            "queue manager stopped"
        );
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    /// Samples dropped so far. Shorthand for `self.stats().dropped()`.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped()
    }

    /// Number of shards.
    pub fn shards(&self) -> usize {
        self.config.shards
    }

    /// The rejection gate the workers consult.
    pub fn gate(&self) -> &Arc<RejectGate> {
        &self.gate
    }
}

/// Maps a fingerprint onto `[0, shards)`.
pub fn shard_index(fingerprint: u64, shards: usize) -> usize {
    let shards = u64::try_from(shards).unwrap_or(u64::MAX).max(1);
    usize::try_from(fingerprint % shards).unwrap_or(0)
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result
            && e.is_panic()
        {
            warn!(error = %e, "shard worker panicked");
        }
    }
}
