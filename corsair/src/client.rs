//! Signing HTTP client for the remote sink.
//!
//! [`SigningClient`] turns a batch into a signed remote-write POST and maps
//! the result onto an [`Outcome`]. The mapping from `(status, body)` to an
//! outcome is the pure function [`classify`]; transport failures never reach
//! it and are always [`Outcome::Recoverable`].
//!
//! Retrying is not done here. The shard worker owns batch-level retry and
//! calls [`RemoteStorage::store`] once per attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, DATE, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::auth::{AuthContext, http_date};
use crate::error::SendError;
use crate::remote_write::{self, compress_snappy};
use crate::sample::{LabelSet, Sample};

/// Value of the `X-Version` and `User-Agent` headers.
pub const VERSION: &str = concat!("corsair/", env!("CARGO_PKG_VERSION"));

/// Maximum number of error-body bytes read from a failed response.
pub const MAX_ERROR_BODY: usize = 256;

/// Path of the identity check endpoint, relative to the remote host.
pub const SOURCE_CHECK_PATH: &str = "/v1/issue-source";

/// How a single delivery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The remote sink accepted the batch.
    Success,
    /// Transient failure; the batch may be retried.
    Recoverable,
    /// The batch was refused; drop it without retrying.
    NonRecoverable,
    /// The remote sink refuses this identity; stop sending altogether.
    FatalReject,
}

/// Structured error object a remote sink may put on the first line of a
/// non-2xx response.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    rejected: bool,
}

/// Classifies a remote response.
///
/// 2xx is [`Outcome::Success`]. Any other status whose body starts with a
/// JSON object carrying `"rejected": true` is [`Outcome::FatalReject`].
/// Remaining 5xx responses are [`Outcome::Recoverable`] and everything else
/// is [`Outcome::NonRecoverable`]. Only the first line of the first
/// [`MAX_ERROR_BODY`] bytes of `body` is inspected.
pub fn classify(status: u16, body: &[u8]) -> Outcome {
    match check_response(status, body) {
        Ok(()) => Outcome::Success,
        Err(err) => err.outcome(),
    }
}

/// Converts a response into `Ok` or the matching [`SendError`].
fn check_response(status: u16, body: &[u8]) -> Result<(), SendError> {
    if (200..300).contains(&status) {
        return Ok(());
    }

    let line = first_line(body);
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&line)
        && parsed.rejected
    {
        let message = if parsed.error.is_empty() {
            parsed.msg
        } else {
            parsed.error
        };
        return Err(SendError::IdentityRejected { status, message });
    }

    if (500..600).contains(&status) {
        Err(SendError::ServerStatus { status, body: line })
    } else {
        Err(SendError::BatchRejected { status, body: line })
    }
}

/// Returns the first line of the bounded error body, lossily decoded.
fn first_line(body: &[u8]) -> String {
    let bounded = &body[..body.len().min(MAX_ERROR_BODY)];
    let line = bounded
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    String::from_utf8_lossy(line).trim_end_matches('\r').to_string()
}

impl SendError {
    /// The delivery outcome this error represents.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Transport { .. } | Self::ServerStatus { .. } => Outcome::Recoverable,
            Self::IdentityRejected { .. } => Outcome::FatalReject,
            Self::Codec(_)
            | Self::InvalidRequest { .. }
            | Self::BatchRejected { .. }
            | Self::SourceCheck { .. } => Outcome::NonRecoverable,
        }
    }

    /// Returns true if retrying the same batch may succeed.
    pub fn is_recoverable(&self) -> bool {
        self.outcome() == Outcome::Recoverable
    }
}

/// A destination for sample batches.
///
/// Implemented by [`SigningClient`]; tests substitute recording mocks.
pub trait RemoteStorage: Send + Sync + 'static {
    /// Delivers one batch. Called once per attempt.
    fn store(&self, batch: &[Sample]) -> impl Future<Output = Result<(), SendError>> + Send;

    /// Short name used in log fields.
    fn name(&self) -> &str;
}

/// Signs and posts remote-write requests.
///
/// Cheap to share: the underlying connection pool and the auth context are
/// reference counted.
#[derive(Debug, Clone)]
pub struct SigningClient {
    http: reqwest::Client,
    endpoint: String,
    auth: Arc<AuthContext>,
    timeout: Duration,
    external_labels: LabelSet,
}

impl SigningClient {
    /// Creates a client posting to `endpoint`.
    ///
    /// `timeout` bounds each request; it is not retried at this layer.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        auth: Arc<AuthContext>,
        timeout: Duration,
    ) -> Result<Self, SendError> {
        let http = reqwest::Client::builder()
            .user_agent(VERSION)
            .build()
            .map_err(|e| SendError::Transport { source: e })?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            auth,
            timeout,
            external_labels: LabelSet::new(),
        })
    }

    /// Sets labels added to every series that lacks them.
    #[must_use]
    pub fn with_external_labels(mut self, labels: LabelSet) -> Self {
        self.external_labels = labels;
        self
    }

    /// The write endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encodes `batch` and posts it.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] classified by [`SendError::outcome`].
    pub async fn send(&self, batch: &[Sample]) -> Result<(), SendError> {
        let body = remote_write::encode(batch, &self.external_labels)?;
        debug!(
            endpoint = %self.endpoint,
            samples = batch.len(),
            bytes = body.len(),
            "sending batch"
        );

        let response = self.post(&self.endpoint, body).await?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(());
        }

        let body = read_bounded(response).await;
        check_response(status, &body)
    }

    /// Asks the remote sink whether this identity may upload.
    ///
    /// Posts a signed empty body to `url`, normally the remote host joined
    /// with [`SOURCE_CHECK_PATH`]. The reply must be a JSON object with an
    /// `error` field; an empty `error` means the identity is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::SourceCheck`] on a 404, an unexpected reply or a
    /// non-empty `error`, and [`SendError::Transport`] on network failure.
    pub async fn check_source(&self, url: &str) -> Result<(), SendError> {
        let body = compress_snappy(&[])?;
        let response = self.post(url, body).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SendError::SourceCheck {
                url: url.to_string(),
                reason: "page not found".to_string(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| SendError::Transport { source: e })?;
        let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
            .map_err(|_| SendError::SourceCheck {
                url: url.to_string(),
                reason: format!("invalid response: {text}"),
            })?;

        match parsed.get("error") {
            Some(serde_json::Value::String(e)) if e.is_empty() => Ok(()),
            Some(serde_json::Value::String(e)) => Err(SendError::SourceCheck {
                url: url.to_string(),
                reason: e.clone(),
            }),
            _ => Err(SendError::SourceCheck {
                url: url.to_string(),
                reason: format!("invalid response: {text}"),
            }),
        }
    }

    /// Builds, signs and sends one POST.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<reqwest::Response, SendError> {
        let date = http_date(Utc::now());
        let authorization = self
            .auth
            .authorization("POST", &body, remote_write::CONTENT_TYPE, &date)
            .map_err(|e| SendError::InvalidRequest {
                reason: format!("cannot sign request: {e}"),
            })?;

        self.http
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_ENCODING, remote_write::CONTENT_ENCODING)
            .header(CONTENT_TYPE, remote_write::CONTENT_TYPE)
            .header(USER_AGENT, VERSION)
            .header("X-Version", VERSION)
            .header("X-Team-Id", &self.auth.team_id)
            .header("X-Uploader-Uid", &self.auth.uploader_uid)
            .header("X-Uploader-Ip", &self.auth.host)
            .header("X-Host-Name", &self.auth.host_name)
            .header(DATE, date)
            .header(AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    SendError::InvalidRequest {
                        reason: e.to_string(),
                    }
                } else {
                    SendError::Transport { source: e }
                }
            })
    }
}

impl RemoteStorage for SigningClient {
    fn store(&self, batch: &[Sample]) -> impl Future<Output = Result<(), SendError>> + Send {
        self.send(batch)
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// Reads at most [`MAX_ERROR_BODY`] bytes of a response body.
///
/// Read errors end the read early; the error body is advisory only.
async fn read_bounded(mut response: reqwest::Response) -> Vec<u8> {
    let mut body = Vec::with_capacity(MAX_ERROR_BODY);
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(MAX_ERROR_BODY - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(classify(200, b""), Outcome::Success);
        assert_eq!(classify(204, b"ignored"), Outcome::Success);
    }

    #[test]
    fn test_classify_server_errors_are_recoverable() {
        assert_eq!(classify(500, b"internal"), Outcome::Recoverable);
        assert_eq!(classify(503, b""), Outcome::Recoverable);
    }

    #[test]
    fn test_classify_client_errors_are_non_recoverable() {
        assert_eq!(classify(400, b"bad batch"), Outcome::NonRecoverable);
        assert_eq!(
            classify(403, br#"{"error": "quota", "rejected": false}"#),
            Outcome::NonRecoverable
        );
        assert_eq!(classify(301, b""), Outcome::NonRecoverable);
    }

    #[test]
    fn test_classify_rejection() {
        let body = br#"{"error": "source disabled", "rejected": true, "msg": ""}"#;
        assert_eq!(classify(403, body), Outcome::FatalReject);
        // The flag wins over a 5xx status.
        assert_eq!(classify(503, body), Outcome::FatalReject);
    }

    #[test]
    fn test_classify_reads_only_first_line() {
        let body = b"not json\n{\"rejected\": true}";
        assert_eq!(classify(403, body), Outcome::NonRecoverable);
    }

    #[test]
    fn test_classify_ignores_bytes_past_cap() {
        let mut body = vec![b' '; MAX_ERROR_BODY];
        body.extend_from_slice(br#"{"rejected": true}"#);
        assert_eq!(classify(403, &body), Outcome::NonRecoverable);
    }

    #[test]
    fn test_rejection_message() {
        let err = check_response(403, br#"{"msg": "m", "error": "e", "rejected": true}"#).unwrap_err();
        assert!(matches!(err, SendError::IdentityRejected { ref message, .. } if message == "e"));

        let err = check_response(403, br#"{"msg": "only msg", "rejected": true}"#).unwrap_err();
        assert!(
            matches!(err, SendError::IdentityRejected { ref message, .. } if message == "only msg")
        );
    }

    #[test]
    fn test_error_body_is_first_line() {
        let err = check_response(400, b"line one\r\nline two").unwrap_err();
        assert!(matches!(err, SendError::BatchRejected { ref body, .. } if body == "line one"));
    }

    #[test]
    fn test_outcome_of_local_errors() {
        let invalid = SendError::InvalidRequest {
            reason: "bad header".to_string(),
        };
        assert_eq!(invalid.outcome(), Outcome::NonRecoverable);
        assert!(!invalid.is_recoverable());
        assert!(
            SendError::ServerStatus {
                status: 502,
                body: String::new()
            }
            .is_recoverable()
        );
    }
}
