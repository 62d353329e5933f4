//! Parser for the line-oriented metrics exposition format.
//!
//! Understands the Prometheus text format (version 0.0.4) and OpenMetrics.
//! The parser is a lazy [`Iterator`] over [`Sample`]s: metadata lines
//! (`# TYPE`, `# HELP`, `# UNIT`, other comments) are consumed silently, and a
//! series line that fails to parse is logged and skipped without affecting
//! the rest of the body.
//!
//! ```text
//! # HELP node_load1 1m load average.
//! # TYPE node_load1 gauge
//! node_load1 0.42
//! http_requests_total{method="post",code="200"} 1027 1395066363000
//! ```
//!
//! The metric name is stored as the `__name__` label. Series lines without a
//! timestamp are stamped with the scrape time.

use crate::error::ParseError;
use crate::sample::{LabelSet, METRIC_NAME_LABEL, Sample};

/// Content type prefix announcing OpenMetrics.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text";

/// Exposition format variant, selected from the response `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Prometheus text format; timestamps are integer milliseconds.
    Text,
    /// OpenMetrics; timestamps are float seconds and `# EOF` ends the body.
    OpenMetrics,
}

impl Format {
    /// Picks the format announced by a `Content-Type` header value.
    ///
    /// Anything that is not OpenMetrics is parsed as the text format.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with(OPENMETRICS_CONTENT_TYPE)
        {
            Format::OpenMetrics
        } else {
            Format::Text
        }
    }
}

/// Parses an exposition body into a lazy sequence of samples.
///
/// `default_timestamp` (milliseconds) is used for series lines that carry no
/// timestamp of their own, normally the time the scrape started.
pub fn parse<'a>(body: &'a [u8], content_type: &str, default_timestamp: i64) -> Parser<'a> {
    Parser::new(body, Format::from_content_type(content_type), default_timestamp)
}

/// Lazy iterator of samples over one exposition body.
///
/// Created fresh for each scrape; not restartable.
#[derive(Debug)]
pub struct Parser<'a> {
    lines: std::slice::Split<'a, u8, fn(&u8) -> bool>,
    format: Format,
    default_timestamp: i64,
    line_number: usize,
    skipped: usize,
    finished: bool,
}

impl<'a> Parser<'a> {
    /// Creates a parser over `body`.
    pub fn new(body: &'a [u8], format: Format, default_timestamp: i64) -> Self {
        let is_newline: fn(&u8) -> bool = |b| *b == b'\n';
        Self {
            lines: body.split(is_newline),
            format,
            default_timestamp,
            line_number: 0,
            skipped: 0,
            finished: false,
        }
    }

    /// Number of series lines skipped so far because they failed to parse.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Parses one raw line. `Ok(None)` means the line carries no sample.
    fn parse_line(&mut self, raw: &[u8]) -> Result<Option<Sample>, ParseError> {
        let line_number = self.line_number;
        let line = std::str::from_utf8(raw)
            .map_err(|_| ParseError::InvalidUtf8 { line: line_number })?
            .trim_end_matches('\r');

        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            if self.format == Format::OpenMetrics && comment.trim() == "EOF" {
                self.finished = true;
            }
            return Ok(None);
        }

        let mut cursor = Cursor::new(trimmed, line_number);
        let (labels, value, timestamp) = cursor.series(self.format)?;
        let sample = Sample::new(labels, timestamp.unwrap_or(self.default_timestamp), value)?;
        Ok(Some(sample))
    }
}

impl Iterator for Parser<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        while !self.finished {
            let raw = self.lines.next()?;
            self.line_number += 1;

            match self.parse_line(raw) {
                Ok(Some(sample)) => return Some(sample),
                Ok(None) => {}
                Err(e) => {
                    self.skipped += 1;
                    tracing::debug!(error = %e, "skipping exposition line");
                }
            }
        }
        None
    }
}

/// Byte cursor over a single series line.
struct Cursor<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str, line: usize) -> Self {
        Self {
            input,
            pos: 0,
            line,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(usize, u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !pred(self.pos - start, b) {
                break;
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn labels_error(&self, reason: impl Into<String>) -> ParseError {
        ParseError::InvalidLabels {
            line: self.line,
            reason: reason.into(),
        }
    }

    /// Parses `name{labels} value [timestamp]`.
    fn series(&mut self, format: Format) -> Result<(LabelSet, f64, Option<i64>), ParseError> {
        let name = self.take_while(|i, b| is_metric_name_byte(i, b));
        if name.is_empty() {
            return Err(ParseError::InvalidMetricName { line: self.line });
        }

        let mut labels = LabelSet::new();
        labels.insert(METRIC_NAME_LABEL, name);

        // A blank separates the value from the name, or from the closing
        // `}` when labels are present.
        let before = self.pos;
        self.skip_blanks();
        let mut separated = self.pos > before;
        if self.peek() == Some(b'{') {
            self.pos += 1;
            self.label_block(&mut labels)?;
            let after = self.pos;
            self.skip_blanks();
            separated = self.pos > after;
        }

        if !separated {
            return Err(ParseError::InvalidValue {
                line: self.line,
                value: self.input[self.pos..].to_string(),
            });
        }

        let value_token = self.take_while(|_, b| !matches!(b, b' ' | b'\t'));
        let value = parse_value(value_token).ok_or_else(|| ParseError::InvalidValue {
            line: self.line,
            value: value_token.to_string(),
        })?;

        self.skip_blanks();
        let timestamp = match self.peek() {
            None => None,
            // OpenMetrics exemplar: `value # {labels} value [ts]`.
            Some(b'#') if format == Format::OpenMetrics => None,
            Some(_) => {
                let token = self.take_while(|_, b| !matches!(b, b' ' | b'\t'));
                let ts = parse_timestamp(token, format).ok_or_else(|| {
                    ParseError::InvalidTimestamp {
                        line: self.line,
                        value: token.to_string(),
                    }
                })?;
                self.skip_blanks();
                match self.peek() {
                    None => {}
                    Some(b'#') if format == Format::OpenMetrics => {}
                    Some(_) => {
                        return Err(ParseError::InvalidTimestamp {
                            line: self.line,
                            value: self.input[self.pos..].to_string(),
                        });
                    }
                }
                Some(ts)
            }
        };

        Ok((labels, value, timestamp))
    }

    /// Parses the label pairs after an opening `{` up to and including `}`.
    fn label_block(&mut self, labels: &mut LabelSet) -> Result<(), ParseError> {
        loop {
            self.skip_blanks();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(());
            }

            let name = self.take_while(|i, b| is_label_name_byte(i, b));
            if name.is_empty() {
                return Err(self.labels_error("expected label name"));
            }

            self.skip_blanks();
            if self.peek() != Some(b'=') {
                return Err(self.labels_error(format!("expected '=' after '{name}'")));
            }
            self.pos += 1;
            self.skip_blanks();

            let value = self.quoted()?;
            if name == METRIC_NAME_LABEL || labels.insert(name, value).is_some() {
                return Err(ParseError::DuplicateLabel {
                    line: self.line,
                    name: name.to_string(),
                });
            }

            self.skip_blanks();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.labels_error("expected ',' or '}'")),
            }
        }
    }

    /// Parses a double-quoted label value, resolving escapes.
    fn quoted(&mut self) -> Result<String, ParseError> {
        if self.peek() != Some(b'"') {
            return Err(self.labels_error("expected '\"'"));
        }
        self.pos += 1;

        let mut value = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                other => value.push(other),
            }
        }
        Err(self.labels_error("unterminated label value"))
    }
}

fn is_metric_name_byte(index: usize, b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || (index > 0 && b.is_ascii_digit())
}

fn is_label_name_byte(index: usize, b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || (index > 0 && b.is_ascii_digit())
}

/// Parses a sample value; accepts `NaN`, `+Inf` and `-Inf` in any case.
fn parse_value(token: &str) -> Option<f64> {
    token.parse::<f64>().ok()
}

/// Parses a timestamp into milliseconds since the epoch.
#[allow(clippy::cast_possible_truncation)] // OpenMetrics seconds-to-ms fits i64 for any sane epoch
fn parse_timestamp(token: &str, format: Format) -> Option<i64> {
    match format {
        Format::Text => token.parse::<i64>().ok(),
        Format::OpenMetrics => {
            let seconds = token.parse::<f64>().ok()?;
            seconds
                .is_finite()
                .then(|| (seconds * 1000.0).round() as i64)
        }
    }
}
