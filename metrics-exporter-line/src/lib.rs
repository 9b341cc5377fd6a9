//! A buffered, sampled exporter for sending metrics to a remote collector over a compact line protocol.
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_exporter_line::{AggregationKind, LineExporterBuilder, PutOutcome};
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the exporter, such as changing the remote address, adjusting when
//! // buffers are flushed, configuring sampling, and more.
//! let engine = LineExporterBuilder::default()
//!     .with_prefix("myapp")
//!     .with_flush_size(500)
//!     .build()
//!     .expect("failed to build engine");
//!
//! // Samples created through the engine carry its defaults: the prefix as namespace, the default sample rate, and
//! // the default aggregation frequency.
//! let sample = engine.sample("requests", 1).with_tag("route", "/login");
//! assert_eq!(engine.put(&sample), PutOutcome::Buffered);
//!
//! // Samples with aggregations are kept apart, in a buffer per aggregation kind and frequency.
//! let sample = engine.sample("latency_ms", 12.5).with_aggregation(AggregationKind::P99);
//! engine.put(&sample);
//!
//! // Buffers are flushed in the background as they fill up and at every flush interval. Shutting down flushes
//! // whatever is left.
//! engine.shutdown();
//! ```
//!
//! # Line protocol
//!
//! Each sample is encoded as a single line:
//!
//! ```text
//! [namespace.]name[,tag=value...] value timestamp[ aggregation,...,frequency]
//! ```
//!
//! Spaces and commas in the name, and spaces, commas and equals signs in tag keys and values, are escaped with a
//! backslash. Lines are joined with a newline when a batch is flushed.
//!
//! # Features
//!
//! ## Buffering
//!
//! Producers never block. Lines are held in bounded lock-free buffers: when the standard buffer is full, new lines are
//! dropped, and when an aggregated buffer is full, its oldest line is evicted.
//!
//! ## Sampling
//!
//! Each sample carries a sample rate, as a percentage. Samples without a sample rate are never sent.
//!
//! ## Transports
//!
//! Metrics can be sent over UDP, or over Unix domain sockets in either `SOCK_DGRAM` or `SOCK_STREAM` mode. With the
//! `http` feature enabled, metrics can be posted to an HTTP endpoint instead. Any other sink can be plugged in by
//! implementing [`Transport`].
//!
//! ## Telemetry
//!
//! The exporter reports its own behavior, such as samples buffered or dropped, and payloads and bytes sent, as
//! counters through the [`metrics`] facade, under the `metrics_exporter_line.client` namespace.
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod buffer;

mod builder;
pub use self::builder::{BuildError, LineExporterBuilder};

mod engine;
pub use self::engine::{BufferedMetricsEngine, EngineConfiguration, PutOutcome};

mod sample;
pub use self::sample::{
    AggregationFrequency, AggregationKey, AggregationKind, MetricSample, MetricValue,
};

mod sampler;
pub use self::sampler::Sampler;

mod scheduler;
mod telemetry;

pub mod transport;
pub use self::transport::{Transport, TransportError};

mod writer;
pub use self::writer::{EncodeError, MessageEncoder};
