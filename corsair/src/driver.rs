//! Scrape loop and pipeline lifecycle.
//!
//! The [`Driver`] ticks at the scrape interval. Each tick scrapes the target,
//! parses the body and appends every sample to the queue. The loop runs
//! under [`supervise`], which restarts it after a panic.
//!
//! [`Driver::run`] returns when the caller's shutdown future completes or
//! when the rejection gate halts the pipeline. In both cases the queue is
//! stopped with its flush deadline before returning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::RemoteStorage;
use crate::error::{CorsairError, Result, ScrapeError};
use crate::queue::QueueManager;
use crate::scrape::Scraper;

/// Delay before a crashed task is restarted.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// What one scrape cycle produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    /// Samples accepted by the queue.
    pub appended: usize,
    /// Samples the queue dropped.
    pub dropped: usize,
    /// Exposition lines that failed to parse.
    pub skipped: usize,
}

/// Ties the scraper to the queue manager.
#[derive(Debug)]
pub struct Driver<S> {
    scraper: Scraper,
    queue: Arc<QueueManager<S>>,
    interval: Duration,
}

impl<S> Clone for Driver<S> {
    fn clone(&self) -> Self {
        Self {
            scraper: self.scraper.clone(),
            queue: Arc::clone(&self.queue),
            interval: self.interval,
        }
    }
}

impl<S: RemoteStorage> Driver<S> {
    /// Creates a driver scraping with `scraper` every `interval`.
    pub fn new(scraper: Scraper, queue: Arc<QueueManager<S>>, interval: Duration) -> Self {
        Self {
            scraper,
            queue,
            interval,
        }
    }

    /// The queue this driver feeds.
    pub fn queue(&self) -> &Arc<QueueManager<S>> {
        &self.queue
    }

    /// Runs one scrape cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError`] if the target could not be fetched; nothing
    /// is appended in that case.
    pub async fn scrape_once(&self) -> std::result::Result<ScrapeReport, ScrapeError> {
        let scrape_time = Utc::now().timestamp_millis();
        let body = self.scraper.scrape().await?;

        let mut report = ScrapeReport::default();
        let mut samples = body.samples(scrape_time);
        for sample in samples.by_ref() {
            if self.queue.append(sample) {
                report.appended += 1;
            } else {
                report.dropped += 1;
            }
        }
        report.skipped = samples.skipped();

        if report.dropped > 0 {
            warn!(
                dropped = report.dropped,
                total_dropped = self.queue.dropped(),
                "queue full, samples dropped"
            );
        }
        debug!(
            appended = report.appended,
            skipped = report.skipped,
            "scrape cycle complete"
        );
        Ok(report)
    }

    /// Starts the queue and scrapes until `shutdown` completes or the
    /// pipeline is halted, then stops the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CorsairError::Rejected`] if the remote sink rejected this
    /// identity under the halt policy.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.queue.start();
        info!(
            url = self.scraper.url(),
            interval_ms = self.interval.as_millis(),
            "pipeline started"
        );

        let cancel = CancellationToken::new();
        let driver = self.clone();
        let scrape_loop = tokio::spawn(supervise(
            "scrape loop",
            RESTART_DELAY,
            cancel.clone(),
            move || driver.clone().scrape_loop(),
        ));

        let gate = Arc::clone(self.queue.gate());
        let halted = tokio::select! {
            () = shutdown => false,
            () = gate.halted() => true,
        };

        cancel.cancel();
        if let Err(e) = scrape_loop.await {
            warn!(error = %e, "scrape loop supervisor failed");
        }
        self.queue.stop().await;

        if halted {
            let message = gate.message().unwrap_or_default();
            error!(message = %message, "pipeline halted by identity rejection");
            return Err(CorsairError::Rejected { message });
        }
        info!("pipeline stopped");
        Ok(())
    }

    /// Scrapes on every tick, forever. A failed cycle is logged and the next
    /// tick proceeds normally.
    async fn scrape_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.scrape_once().await {
                warn!(error = %e, "scrape failed");
            }
        }
    }
}

/// Runs the task built by `make` and restarts it after a panic.
///
/// Returns when the task finishes normally or when `cancel` fires; in the
/// latter case the running task is aborted.
pub async fn supervise<F, Fut>(
    name: &'static str,
    restart_delay: Duration,
    cancel: CancellationToken,
    mut make: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let mut handle = tokio::spawn(make());

        let result = tokio::select! {
            () = cancel.cancelled() => {
                handle.abort();
                return;
            }
            result = &mut handle => result,
        };

        match result {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(task = name, error = %e, "task panicked, restarting");
            }
            Err(_) => return,
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(restart_delay) => {}
        }
    }
}
