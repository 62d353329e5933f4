//! Remote-write wire encoding for sample batches.
//!
//! A batch is grouped into a `WriteRequest`, serialized to protobuf and
//! compressed with raw Snappy. [`decode`] reverses the process and is what a
//! receiving sink (or a test) uses to recover the samples.
//!
//! # Grouping
//!
//! Consecutive samples with identical label sets share one `TimeSeries`
//! entry; everything else gets its own entry. Every sample of the batch lands
//! in exactly one entry, and flattening the request yields the batch in its
//! original order.
//!
//! # Example
//!
//! ```rust
//! use corsair::remote_write::{decode, encode};
//! use corsair::sample::{LabelSet, Sample};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let labels: LabelSet = [("__name__", "up")].into_iter().collect();
//! let batch = vec![Sample::new(labels, 1_700_000_000_000, 1.0)?];
//!
//! let body = encode(&batch, &LabelSet::new())?;
//! assert_eq!(decode(&body)?, batch);
//! # Ok(())
//! # }
//! ```

use prost::Message;

use crate::error::CodecError;
use crate::sample::{LabelSet, Sample};

/// Content type of an encoded write request.
pub const CONTENT_TYPE: &str = "application/x-protobuf";

/// Content encoding of an encoded write request.
pub const CONTENT_ENCODING: &str = "snappy";

/// Protobuf messages of the remote-write protocol.
///
/// Field numbers follow `prompb/remote.proto` and `prompb/types.proto`;
/// only the fields a sender fills in are declared.
pub mod proto {
    /// Request body: every series in the batch.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// Series in request order.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// One series and the points sent for it.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Labels, sorted by name.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Points in append order.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// Name/value pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// One point of a series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// Observed value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Milliseconds since the Unix epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// Encodes a batch as a Snappy-compressed remote-write protobuf body.
///
/// `external_labels` are added to every series that does not already carry a
/// label of the same name.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization or compression fails.
pub fn encode(batch: &[Sample], external_labels: &LabelSet) -> Result<Vec<u8>, CodecError> {
    let request = build_write_request(batch, external_labels);
    compress_snappy(&serialize_write_request(&request)?)
}

/// Decodes a Snappy-compressed remote-write body back into samples.
///
/// Samples come back in request order: series by series, and within each
/// series in the order they were written.
///
/// # Errors
///
/// Returns [`CodecError`] if the body is not valid Snappy, not a valid
/// `WriteRequest`, or contains a series without labels.
pub fn decode(body: &[u8]) -> Result<Vec<Sample>, CodecError> {
    let proto_bytes = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| CodecError::Decompression { source: e })?;
    let request = proto::WriteRequest::decode(proto_bytes.as_slice())
        .map_err(|e| CodecError::Deserialization { source: e })?;

    let mut samples = Vec::new();
    for series in request.timeseries {
        let labels: LabelSet = series
            .labels
            .into_iter()
            .map(|label| (label.name, label.value))
            .collect();
        for point in series.samples {
            let sample = Sample::new(labels.clone(), point.timestamp, point.value)
                .map_err(|_| CodecError::EmptySeries)?;
            samples.push(sample);
        }
    }
    Ok(samples)
}

/// Groups a batch into a `WriteRequest`.
///
/// Runs of consecutive samples sharing a label set become one `TimeSeries`.
pub fn build_write_request(batch: &[Sample], external_labels: &LabelSet) -> proto::WriteRequest {
    let mut timeseries: Vec<proto::TimeSeries> = Vec::new();
    let mut previous: Option<&LabelSet> = None;

    for sample in batch {
        let point = proto::Sample {
            value: sample.value(),
            timestamp: sample.timestamp(),
        };

        let same_series = previous == Some(sample.labels());
        match timeseries.last_mut() {
            Some(series) if same_series => series.samples.push(point),
            _ => timeseries.push(proto::TimeSeries {
                labels: build_labels(sample.labels(), external_labels),
                samples: vec![point],
            }),
        }
        previous = Some(sample.labels());
    }

    proto::WriteRequest { timeseries }
}

/// Builds protobuf labels from a label set plus external labels.
///
/// The result is sorted by name, as the remote-write protocol requires.
fn build_labels(labels: &LabelSet, external_labels: &LabelSet) -> Vec<proto::Label> {
    let mut merged = labels.clone();
    merged.merge_missing(external_labels);

    merged
        .iter()
        .map(|(name, value)| proto::Label {
            name: name.to_string(),
            value: value.to_string(),
        })
        .collect()
}

fn serialize_write_request(request: &proto::WriteRequest) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut out)
        .map_err(|e| CodecError::Serialization { source: e })?;
    Ok(out)
}

/// Raw (unframed) Snappy, as the remote-write protocol expects.
pub(crate) fn compress_snappy(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| CodecError::Compression { source: e })
}
