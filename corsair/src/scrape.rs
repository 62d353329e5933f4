//! Fetching the local exposition endpoint.
//!
//! [`Scraper::scrape`] performs one GET and returns the raw body together
//! with its `Content-Type`; parsing is left to [`crate::exposition`]. A
//! gzip-encoded body is inflated before it is returned.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::debug;

use crate::client::VERSION;
use crate::error::ScrapeError;
use crate::exposition::{self, Parser};

/// Exposition formats we accept, in order of preference.
pub const ACCEPT_HEADER: &str =
    "application/openmetrics-text; version=0.0.1,text/plain;version=0.0.4;q=0.5,*/*;q=0.1";

/// A fetched exposition body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeBody {
    /// The body, already inflated.
    pub bytes: Vec<u8>,
    /// The response `Content-Type`, empty if absent.
    pub content_type: String,
}

impl ScrapeBody {
    /// Parses the body, stamping samples without a timestamp with
    /// `scrape_time` (milliseconds since the Unix epoch).
    pub fn samples(&self, scrape_time: i64) -> Parser<'_> {
        exposition::parse(&self.bytes, &self.content_type, scrape_time)
    }
}

/// HTTP client for one scrape target.
#[derive(Debug, Clone)]
pub struct Scraper {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl Scraper {
    /// Creates a scraper for `url`; each scrape is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError::ClientCreate`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .user_agent(VERSION)
            .build()
            .map_err(|e| ScrapeError::ClientCreate { source: e })?;

        Ok(Self {
            http,
            url: url.into(),
            timeout,
        })
    }

    /// The scrape target.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the target once.
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError`] on transport failure, on any status other
    /// than 200, or if the body cannot be read or inflated.
    pub async fn scrape(&self) -> Result<ScrapeBody, ScrapeError> {
        let response = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .header(ACCEPT, ACCEPT_HEADER)
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await
            .map_err(|e| ScrapeError::Request {
                url: self.url.clone(),
                source: e,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ScrapeError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE).unwrap_or_default();
        let gzipped = header(CONTENT_ENCODING).is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"));

        let raw = response.bytes().await.map_err(|e| ScrapeError::Body {
            url: self.url.clone(),
            source: e,
        })?;
        let bytes = if gzipped {
            inflate_gzip(&raw)?
        } else {
            raw.to_vec()
        };

        debug!(
            url = %self.url,
            bytes = bytes.len(),
            gzipped,
            content_type = %content_type,
            "scraped target"
        );
        Ok(ScrapeBody {
            bytes,
            content_type,
        })
    }
}

/// Inflates a gzip stream.
///
/// # Errors
///
/// Returns [`ScrapeError::Inflate`] if `data` is not valid gzip.
pub fn inflate_gzip(data: &[u8]) -> Result<Vec<u8>, ScrapeError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ScrapeError::Inflate { source: e })?;
    Ok(out)
}
