use std::time::SystemTime;

use thiserror::Error;

use crate::sample::MetricSample;

/// Errors that could occur while encoding a metric sample.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The sample has an empty name.
    #[error("metric name must not be empty")]
    MissingName,

    /// The sample has an empty value.
    #[error("metric value must not be empty (metric '{name}')")]
    MissingValue {
        /// Name of the offending metric.
        name: String,
    },
}

/// Encodes metric samples into the line protocol.
///
/// Every sample becomes a single line, without a trailing newline:
///
/// ```text
/// [namespace.]name[,tag=value]* value timestamp[ agg[,agg]*,frequency]
/// ```
///
/// In the namespace and name, spaces and commas are escaped with a backslash. In tag keys and values, spaces, commas
/// and equals signs are escaped with a backslash. The value is written verbatim.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageEncoder;

impl MessageEncoder {
    /// Creates a new `MessageEncoder`.
    pub const fn new() -> Self {
        MessageEncoder
    }

    /// Encodes the sample, stamping it with the current time if it carries no timestamp of its own.
    ///
    /// # Errors
    ///
    /// If the sample has an empty name or value, an error is returned.
    pub fn encode(&self, sample: &MetricSample) -> Result<String, EncodeError> {
        self.encode_at(sample, unix_timestamp())
    }

    /// Encodes the sample, stamping it with `default_timestamp` if it carries no timestamp of its own.
    ///
    /// # Errors
    ///
    /// If the sample has an empty name or value, an error is returned.
    pub fn encode_at(
        &self,
        sample: &MetricSample,
        default_timestamp: u64,
    ) -> Result<String, EncodeError> {
        if sample.name().is_empty() {
            return Err(EncodeError::MissingName);
        }
        if sample.value().is_empty() {
            return Err(EncodeError::MissingValue { name: sample.name().to_string() });
        }

        let mut buf = String::with_capacity(64);

        if let Some(namespace) = sample.namespace() {
            write_escaped(&mut buf, namespace, NAME_SPECIALS);
            buf.push('.');
        }
        write_escaped(&mut buf, sample.name(), NAME_SPECIALS);

        for (key, value) in sample.tags() {
            buf.push(',');
            write_escaped(&mut buf, key, TAG_SPECIALS);
            buf.push('=');
            write_escaped(&mut buf, value, TAG_SPECIALS);
        }

        buf.push(' ');
        buf.push_str(sample.value().as_str());

        let mut int_writer = itoa::Buffer::new();
        buf.push(' ');
        buf.push_str(int_writer.format(sample.timestamp().unwrap_or(default_timestamp)));

        let mut wrote_aggregation = false;
        for kind in sample.aggregations() {
            buf.push(if wrote_aggregation { ',' } else { ' ' });
            buf.push_str(kind.as_str());
            wrote_aggregation = true;
        }

        if wrote_aggregation {
            buf.push(',');
            buf.push_str(int_writer.format(sample.frequency().seconds()));
        }

        Ok(buf)
    }
}

const NAME_SPECIALS: &[char] = &[' ', ','];
const TAG_SPECIALS: &[char] = &[' ', ',', '='];

fn write_escaped(buf: &mut String, raw: &str, specials: &[char]) {
    for c in raw.chars() {
        if specials.contains(&c) {
            buf.push('\\');
        }
        buf.push(c);
    }
}

/// Returns the current time in seconds since the Unix epoch.
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
