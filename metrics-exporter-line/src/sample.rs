use std::fmt;

use indexmap::{IndexMap, IndexSet};

/// Statistical reducer applied server-side to an aggregated metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregationKind {
    /// Arithmetic mean.
    Avg,
    /// Sum of all values.
    Sum,
    /// Number of values.
    Count,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// 50th percentile.
    Median,
    /// 75th percentile.
    P75,
    /// 90th percentile.
    P90,
    /// 95th percentile.
    P95,
    /// 99th percentile.
    P99,
    /// 99.9th percentile.
    P999,
}

impl AggregationKind {
    /// All aggregation kinds, in declaration order.
    pub const ALL: [AggregationKind; 11] = [
        AggregationKind::Avg,
        AggregationKind::Sum,
        AggregationKind::Count,
        AggregationKind::Min,
        AggregationKind::Max,
        AggregationKind::Median,
        AggregationKind::P75,
        AggregationKind::P90,
        AggregationKind::P95,
        AggregationKind::P99,
        AggregationKind::P999,
    ];

    /// Returns the canonical label used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            AggregationKind::Avg => "avg",
            AggregationKind::Sum => "sum",
            AggregationKind::Count => "count",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::Median => "median",
            AggregationKind::P75 => "p75",
            AggregationKind::P90 => "p90",
            AggregationKind::P95 => "p95",
            AggregationKind::P99 => "p99",
            AggregationKind::P999 => "p999",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Width of the time bucket, in seconds, over which an aggregation is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregationFrequency {
    /// 10 seconds.
    Freq10,
    /// 30 seconds.
    Freq30,
    /// 60 seconds.
    Freq60,
    /// 120 seconds.
    Freq120,
    /// 180 seconds.
    Freq180,
    /// 300 seconds.
    Freq300,
}

impl AggregationFrequency {
    /// All aggregation frequencies, from shortest to longest.
    pub const ALL: [AggregationFrequency; 6] = [
        AggregationFrequency::Freq10,
        AggregationFrequency::Freq30,
        AggregationFrequency::Freq60,
        AggregationFrequency::Freq120,
        AggregationFrequency::Freq180,
        AggregationFrequency::Freq300,
    ];

    /// Returns the bucket width in seconds.
    pub const fn seconds(self) -> u32 {
        match self {
            AggregationFrequency::Freq10 => 10,
            AggregationFrequency::Freq30 => 30,
            AggregationFrequency::Freq60 => 60,
            AggregationFrequency::Freq120 => 120,
            AggregationFrequency::Freq180 => 180,
            AggregationFrequency::Freq300 => 300,
        }
    }

    /// Looks up the frequency with the given bucket width, if it is one of the supported widths.
    pub fn from_seconds(seconds: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|freq| freq.seconds() == seconds)
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AggregationFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seconds())
    }
}

/// Identifies a single aggregated sub-buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    /// Aggregation kind.
    pub kind: AggregationKind,

    /// Aggregation frequency.
    pub frequency: AggregationFrequency,
}

impl AggregationKey {
    /// Creates a new `AggregationKey`.
    pub const fn new(kind: AggregationKind, frequency: AggregationFrequency) -> Self {
        Self { kind, frequency }
    }

    /// Returns the transport destination for batches of this key, in the form `<kind>/<frequency>`.
    pub fn destination(&self) -> String {
        format!("{}/{}", self.kind, self.frequency)
    }
}

/// A metric value, already formatted for the wire.
///
/// Integers are formatted with [`itoa`] and floating-point numbers with [`ryu`], matching how the values would be
/// rendered by hand. Strings are taken verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricValue(String);

impl MetricValue {
    /// Returns the formatted value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue(value.to_string())
    }
}

macro_rules! impl_integer_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for MetricValue {
                fn from(value: $ty) -> Self {
                    MetricValue(itoa::Buffer::new().format(value).to_string())
                }
            }
        )*
    };
}

impl_integer_value!(i32, i64, u32, u64, usize);

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue(ryu::Buffer::new().format(value).to_string())
    }
}

/// A single, fully-resolved metric occurrence.
///
/// Samples are built once, with the `with_*` methods, and then handed to the engine. The engine never mutates a
/// sample: when the timestamp is absent it is resolved to the current time at the moment the sample is encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    name: String,
    value: MetricValue,
    tags: IndexMap<String, String>,
    aggregations: IndexSet<AggregationKind>,
    frequency: AggregationFrequency,
    sample_rate: Option<i64>,
    namespace: Option<String>,
    timestamp: Option<u64>,
}

impl MetricSample {
    /// Creates a new `MetricSample` with the given name and value.
    ///
    /// The sample starts out with no tags, no aggregations, a frequency of 60 seconds, a sample rate of 100, no
    /// namespace, and no timestamp.
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<MetricValue>,
    {
        MetricSample {
            name: name.into(),
            value: value.into(),
            tags: IndexMap::new(),
            aggregations: IndexSet::new(),
            frequency: AggregationFrequency::Freq60,
            sample_rate: Some(100),
            namespace: None,
            timestamp: None,
        }
    }

    /// Adds a tag.
    ///
    /// Adding a tag whose key already exists replaces the value but keeps the original position.
    #[must_use]
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds all of the given tags, in iteration order.
    #[must_use]
    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Adds an aggregation kind.
    #[must_use]
    pub fn with_aggregation(mut self, kind: AggregationKind) -> Self {
        self.aggregations.insert(kind);
        self
    }

    /// Adds all of the given aggregation kinds, in iteration order.
    #[must_use]
    pub fn with_aggregations<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = AggregationKind>,
    {
        self.aggregations.extend(kinds);
        self
    }

    /// Sets the aggregation frequency.
    #[must_use]
    pub fn with_frequency(mut self, frequency: AggregationFrequency) -> Self {
        self.frequency = frequency;
        self
    }

    /// Sets the sample rate, as a percentage.
    ///
    /// `None` opts the sample out of sending entirely.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: Option<i64>) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace<S>(mut self, namespace: S) -> Self
    where
        S: Into<String>,
    {
        self.namespace = Some(namespace.into());
        self
    }

    /// Clears the namespace.
    #[must_use]
    pub fn without_namespace(mut self) -> Self {
        self.namespace = None;
        self
    }

    /// Sets the timestamp, in seconds since the Unix epoch.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metric value.
    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    /// Returns the tags, in insertion order.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the aggregation kinds, in insertion order.
    pub fn aggregations(&self) -> impl Iterator<Item = AggregationKind> + '_ {
        self.aggregations.iter().copied()
    }

    /// Returns `true` if the sample carries at least one aggregation kind.
    pub fn is_aggregated(&self) -> bool {
        !self.aggregations.is_empty()
    }

    /// Returns the aggregation frequency.
    pub fn frequency(&self) -> AggregationFrequency {
        self.frequency
    }

    /// Returns the sample rate.
    pub fn sample_rate(&self) -> Option<i64> {
        self.sample_rate
    }

    /// Returns the namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the timestamp, if any.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Returns the key of the aggregated sub-buffer this sample belongs to.
    ///
    /// The key is formed from the first aggregation kind that was added, and the aggregation frequency. Returns
    /// `None` for samples without aggregations.
    pub fn aggregation_key(&self) -> Option<AggregationKey> {
        self.aggregations.first().map(|kind| AggregationKey::new(*kind, self.frequency))
    }
}
