//! Sample model: label sets, samples, and their fingerprints.
//!
//! A [`Sample`] is an immutable `(labels, timestamp, value)` triple. Labels
//! live in a [`LabelSet`], which keeps names unique and ordered so that
//! equality, serialization order, and the sharding [fingerprint](LabelSet::fingerprint)
//! never depend on the order labels were inserted in.
//!
//! # Example
//!
//! ```rust
//! use corsair::sample::{LabelSet, Sample};
//!
//! let labels: LabelSet = [("__name__", "node_load1"), ("instance", "web1")]
//!     .into_iter()
//!     .collect();
//! let sample = Sample::new(labels, 1_700_000_000_000, 0.42).unwrap();
//!
//! assert_eq!(sample.labels().metric_name(), Some("node_load1"));
//! ```

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::ParseError;

/// Reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label name/value separator fed to the fingerprint hasher.
///
/// `0xff` never occurs in valid UTF-8, so `("ab", "c")` and `("a", "bc")`
/// hash differently.
const SEPARATOR: u8 = 0xff;

/// A set of uniquely named labels identifying one series.
///
/// Labels are kept sorted by name, which is also the order required by the
/// remote-write protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a label, returning the previous value if the name was
    /// already present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.labels.insert(name.into(), value.into())
    }

    /// Returns the value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Returns true if a label called `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    /// Returns the value of the `__name__` label.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns true if the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds every label of `other` whose name is not already present.
    ///
    /// Existing labels always win; this is how external labels are applied
    /// without clobbering labels reported by the scrape target.
    pub fn merge_missing(&mut self, other: &LabelSet) {
        for (name, value) in &other.labels {
            if let btree_map::Entry::Vacant(entry) = self.labels.entry(name.clone()) {
                entry.insert(value.clone());
            }
        }
    }

    /// Computes the fingerprint of this label set.
    ///
    /// The hash is taken over the labels in name order, so two sets holding
    /// the same labels always agree regardless of how they were built.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (name, value) in &self.labels {
            hasher.write(name.as_bytes());
            hasher.write_u8(SEPARATOR);
            hasher.write(value.as_bytes());
            hasher.write_u8(SEPARATOR);
        }
        hasher.finish()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            labels: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.labels.iter()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// A single timestamped observation of one series.
///
/// Samples own their labels outright. Moving a sample into the queue
/// therefore never aliases buffers still held by the scraper.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    labels: LabelSet,
    timestamp: i64,
    value: f64,
}

impl Sample {
    /// Creates a sample.
    ///
    /// `timestamp` is in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::EmptyLabelSet`] if `labels` is empty; a sample
    /// with no labels cannot be attributed to any series.
    pub fn new(labels: LabelSet, timestamp: i64, value: f64) -> Result<Self, ParseError> {
        if labels.is_empty() {
            return Err(ParseError::EmptyLabelSet);
        }
        Ok(Self {
            labels,
            timestamp,
            value,
        })
    }

    /// The series labels.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The observed value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Shorthand for `self.labels().fingerprint()`.
    pub fn fingerprint(&self) -> u64 {
        self.labels.fingerprint()
    }
}
