//! Error types for the corsair telemetry shipping agent.
//!
//! Every stage of the pipeline has its own error enum. Per-sample and
//! per-batch errors are contained by the stage that produces them and only
//! surface through logging and counters; [`CorsairError::Rejected`] is the one
//! condition allowed to stop the whole pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all corsair operations.
#[derive(Error, Debug)]
pub enum CorsairError {
    /// Error parsing an exposition line.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Error fetching the scrape target.
    #[error("scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    /// Error encoding or decoding a write request.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error delivering a batch to the remote sink.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The remote sink has permanently rejected this identity; the pipeline
    /// was halted and needs operator attention.
    #[error("pipeline halted: remote sink rejected this identity: {message}")]
    Rejected {
        /// The rejection message reported by the remote sink.
        message: String,
    },
}

/// Errors raised while parsing one line of exposition text.
///
/// A parse error never aborts a scrape; the offending line is skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// The line is not valid UTF-8.
    #[error("line {line}: not valid UTF-8")]
    InvalidUtf8 {
        /// 1-based line number.
        line: usize,
    },

    /// The metric name is missing or contains invalid characters.
    #[error("line {line}: invalid metric name")]
    InvalidMetricName {
        /// 1-based line number.
        line: usize,
    },

    /// The label block is malformed.
    #[error("line {line}: invalid labels: {reason}")]
    InvalidLabels {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the label block.
        reason: String,
    },

    /// A label name appears twice on the same series.
    #[error("line {line}: duplicate label '{name}'")]
    DuplicateLabel {
        /// 1-based line number.
        line: usize,
        /// The repeated label name.
        name: String,
    },

    /// The sample value could not be parsed as a float.
    #[error("line {line}: invalid value '{value}'")]
    InvalidValue {
        /// 1-based line number.
        line: usize,
        /// The raw value token.
        value: String,
    },

    /// The sample timestamp could not be parsed.
    #[error("line {line}: invalid timestamp '{value}'")]
    InvalidTimestamp {
        /// 1-based line number.
        line: usize,
        /// The raw timestamp token.
        value: String,
    },

    /// A sample was built with no labels at all.
    #[error("sample has an empty label set")]
    EmptyLabelSet,
}

/// Errors that abort a single scrape cycle.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// The HTTP client could not be constructed.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The request failed at the transport level.
    #[error("request to '{url}' failed: {source}")]
    Request {
        /// The scrape target.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The target answered with something other than 200 OK.
    #[error("'{url}' returned HTTP status {status}")]
    HttpStatus {
        /// The scrape target.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Reading the response body failed.
    #[error("failed to read body from '{url}': {source}")]
    Body {
        /// The scrape target.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The gzip-encoded body could not be inflated.
    #[error("failed to inflate gzip body: {source}")]
    Inflate {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from encoding a batch into (or decoding it from) the wire form.
///
/// An encoding failure is fatal to the batch it concerns: the batch is
/// dropped and never retried.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Failed to serialize `WriteRequest` to protobuf.
    #[error("failed to serialize write request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress data with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to decompress Snappy data.
    #[error("failed to decompress data: {source}")]
    Decompression {
        /// The snappy decompression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to decode a `WriteRequest` from protobuf.
    #[error("failed to deserialize write request: {source}")]
    Deserialization {
        /// The protobuf decoding error.
        #[source]
        source: prost::DecodeError,
    },

    /// A decoded series carried no labels.
    #[error("decoded series has no labels")]
    EmptySeries,
}

/// Classified failure of a single delivery attempt.
///
/// Use [`SendError::outcome`] to decide whether the batch is retried,
/// dropped, or whether the whole pipeline must stop.
#[derive(Error, Debug)]
pub enum SendError {
    /// The batch could not be encoded; it is malformed and never retried.
    #[error("failed to encode batch: {0}")]
    Codec(#[from] CodecError),

    /// The request could not be built (bad URL or header value).
    #[error("failed to build request: {reason}")]
    InvalidRequest {
        /// Why the request is invalid.
        reason: String,
    },

    /// Network-level failure: connection refused, DNS, timeout.
    #[error("HTTP request failed: {source}")]
    Transport {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The remote sink failed with a 5xx status.
    #[error("server returned status {status}: {body}")]
    ServerStatus {
        /// The HTTP status code.
        status: u16,
        /// The first line of the response body.
        body: String,
    },

    /// The remote sink refused this batch (4xx or other non-2xx).
    #[error("batch rejected with status {status}: {body}")]
    BatchRejected {
        /// The HTTP status code.
        status: u16,
        /// The first line of the response body.
        body: String,
    },

    /// The remote sink has permanently rejected this data source.
    #[error("identity rejected with status {status}: {message}")]
    IdentityRejected {
        /// The HTTP status code.
        status: u16,
        /// The error message from the rejection body.
        message: String,
    },

    /// The identity check against the remote sink failed.
    #[error("source check at '{url}' failed: {reason}")]
    SourceCheck {
        /// The check endpoint.
        url: String,
        /// What the remote sink reported.
        reason: String,
    },
}

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`crate::config::AgentConfig`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration file could not be written.
    #[error("failed to write config '{}': {source}", path.display())]
    Write {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A field holds an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The obfuscated secret key could not be decoded.
    #[error("invalid secret key: {reason}")]
    Secret {
        /// Why decoding failed.
        reason: String,
    },
}

/// Type alias for `Result<T, CorsairError>`.
pub type Result<T> = std::result::Result<T, CorsairError>;
