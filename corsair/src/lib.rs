//! # corsair
//!
//! Host-side telemetry shipping agent.
//!
//! corsair periodically scrapes a local metrics exposition endpoint, parses
//! the text into typed samples, and forwards them to a remote ingestion
//! service as signed, Snappy-compressed remote-write requests. It is built to
//! keep a bounded memory footprint under backpressure: when the remote side
//! falls behind, samples are dropped and counted rather than buffered.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Data flow
//!
//! ```text
//! Scraper ──▶ exposition::parse ──▶ QueueManager::append
//!                                        │ fingerprint % shards
//!                          ┌─────────────┼─────────────┐
//!                       shard 0       shard 1  ...  shard n
//!                          │ batch by size or deadline │
//!                          └──────▶ SigningClient ◀────┘
//!                                        │ Success / Recoverable /
//!                                        ▼ NonRecoverable / FatalReject
//!                                   remote sink
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use corsair::{AgentConfig, Driver, QueueManager, RejectGate, Scraper, SigningClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::load("corsair.yml")?;
//!
//! let auth = Arc::new(config.auth_context()?);
//! let client = SigningClient::new(config.write_url(), auth, config.remote_timeout)?
//!     .with_external_labels(config.external_labels());
//! let gate = Arc::new(RejectGate::new(config.reject_policy()));
//! let queue = QueueManager::new(
//!     config.queue.clone(),
//!     config.flush_deadline,
//!     Arc::new(client),
//!     gate,
//! )?;
//!
//! let scraper = Scraper::new(&config.scrape_url, config.scrape_timeout)?;
//! let driver = Driver::new(scraper, Arc::new(queue), config.scrape_interval);
//! driver
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sample`]: Label sets, samples and fingerprints
//! - [`exposition`]: Text and OpenMetrics exposition parser
//! - [`scrape`]: HTTP fetch of the exposition endpoint
//! - [`queue`]: Sharded bounded queue with drop accounting
//! - [`shard`]: Per-shard batching, flush timer and retry
//! - [`remote_write`]: Protobuf + Snappy wire encoding
//! - [`auth`]: Request signing
//! - [`client`]: Signing HTTP client and outcome classification
//! - [`gate`]: Pipeline-wide rejection gate
//! - [`driver`]: Scrape loop, supervision and lifecycle
//! - [`config`]: YAML configuration
//! - [`secret`]: Secret key obfuscation
//! - [`error`]: Error types

pub mod auth;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod exposition;
pub mod gate;
pub mod queue;
pub mod remote_write;
pub mod sample;
pub mod scrape;
pub mod secret;
pub mod shard;

// Re-export primary API types at crate root for convenience.
pub use auth::AuthContext;
pub use client::{Outcome, RemoteStorage, SigningClient, classify};
pub use config::AgentConfig;
pub use driver::{Driver, ScrapeReport};
pub use error::{CorsairError, Result};
pub use gate::{RejectAction, RejectGate, RejectPolicy};
pub use queue::{QueueConfig, QueueManager, QueueStats};
pub use sample::{LabelSet, Sample};
pub use scrape::Scraper;
