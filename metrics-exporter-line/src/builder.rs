use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    engine::{BufferedMetricsEngine, EngineConfiguration},
    sample::AggregationFrequency,
    transport::{RemoteAddr, Transport, UdpTransport},
};

const DEFAULT_FLUSH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SAMPLE_RATE: i64 = 100;
const DEFAULT_MAX_BUFFER_SIZE: usize = DEFAULT_FLUSH_SIZE * 500;
const DEFAULT_FLUSH_WORKERS: usize = 1;
const DEFAULT_FLUSH_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 8192;

/// Errors that could occur while building a metrics engine.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to parse the HTTP endpoint.
    #[cfg(feature = "http")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http")))]
    #[error("invalid HTTP endpoint: {reason}")]
    InvalidEndpoint {
        /// Details about the parsing failure.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Which value is out of range, and why.
        reason: &'static str,
    },

    /// Failed to create the transport.
    #[error("failed to create transport: {reason}")]
    Transport {
        /// Details about the failure.
        reason: String,
    },

    /// Failed to spawn the background flush threads.
    #[error("failed to spawn background threads for flushing: {reason}")]
    Backend {
        /// Details about the failure.
        reason: String,
    },
}

enum Destination {
    Remote(RemoteAddr),

    #[cfg(feature = "http")]
    Http(String),

    Custom(Arc<dyn Transport>),
}

/// Builder for a buffered metrics engine.
pub struct LineExporterBuilder {
    destination: Destination,
    write_timeout: Duration,
    max_payload_len: usize,
    flush_size: usize,
    flush_interval: Duration,
    sample_rate: Option<i64>,
    dry_run: bool,
    prefix: Option<String>,
    default_frequency: AggregationFrequency,
    max_buffer_size: usize,
    flush_workers: usize,
    flush_queue_capacity: usize,
    telemetry: bool,
}

impl LineExporterBuilder {
    /// Set the remote address to send metrics to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`. For Unix domain sockets, an address in
    /// the format of `<scheme>://<path>`. The scheme can be either `unix` or `unixgram`, for a stream (`SOCK_STREAM`)
    /// or datagram (`SOCK_DGRAM`) socket, respectively.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        self.destination = Destination::Remote(remote_addr);
        Ok(self)
    }

    /// Send metrics to an HTTP endpoint instead of a socket.
    ///
    /// Each batch is sent as a `POST` request. Batches from aggregated buffers are posted below the endpoint, at
    /// `<endpoint>/<aggregation>/<frequency>`.
    ///
    /// # Errors
    ///
    /// If the endpoint is not a valid URI, an error will be returned indicating the reason.
    #[cfg(feature = "http")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http")))]
    pub fn with_http_endpoint<E>(mut self, endpoint: E) -> Result<Self, BuildError>
    where
        E: AsRef<str>,
    {
        let endpoint = endpoint.as_ref();
        endpoint
            .parse::<hyper::Uri>()
            .map_err(|e| BuildError::InvalidEndpoint { reason: e.to_string() })?;
        self.destination = Destination::Http(endpoint.to_string());
        Ok(self)
    }

    /// Send metrics through the given transport.
    ///
    /// This overrides any remote address or HTTP endpoint.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.destination = Destination::Custom(transport);
        self
    }

    /// Set the write timeout for sending metrics.
    ///
    /// When the write timeout is reached, the write operation will be aborted and the payload being sent at the time
    /// will be dropped without retrying. For HTTP endpoints, this is the timeout of the whole request.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload length for socket transports.
    ///
    /// Batches larger than this are split into several writes on line boundaries. A single line larger than this is
    /// dropped.
    ///
    /// Defaults to 8192 bytes.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Set the flush size.
    ///
    /// As soon as a buffer holds this many lines, a batch of this many lines is flushed in the background.
    ///
    /// Defaults to 100.
    #[must_use]
    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    /// Set the flush interval.
    ///
    /// At every interval, every buffer is flushed, no matter how many lines it holds. Intervals shorter than 50
    /// milliseconds disable periodic flushing, leaving only flushes triggered by the flush size.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the default sample rate, as a percentage.
    ///
    /// Applied to samples created with [`BufferedMetricsEngine::sample`]. `None` means those samples are never sent.
    ///
    /// Defaults to 100.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: Option<i64>) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Sets whether or not to run in dry-run mode.
    ///
    /// In dry-run mode, buffers fill and flush as usual, but payloads are logged instead of being sent.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the prefix.
    ///
    /// Applied as the namespace of samples created with [`BufferedMetricsEngine::sample`].
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the default aggregation frequency.
    ///
    /// Applied to samples created with [`BufferedMetricsEngine::sample`].
    ///
    /// Defaults to 60 seconds.
    #[must_use]
    pub fn with_default_frequency(mut self, frequency: AggregationFrequency) -> Self {
        self.default_frequency = frequency;
        self
    }

    /// Set the maximum number of lines each buffer can hold.
    ///
    /// Applies separately to the standard buffer and to each aggregated sub-buffer. When the standard buffer is full,
    /// new metrics are dropped. When an aggregated sub-buffer is full, its oldest metric is evicted.
    ///
    /// Buffers only hold memory for the lines they currently contain.
    ///
    /// Defaults to 50,000.
    #[must_use]
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Set the number of background threads that run flushes.
    ///
    /// Defaults to 1.
    #[must_use]
    pub fn with_flush_workers(mut self, flush_workers: usize) -> Self {
        self.flush_workers = flush_workers;
        self
    }

    /// Set the number of flush tasks that can wait for a worker.
    ///
    /// When the queue is full, new flush tasks are dropped; the lines they would have flushed stay buffered.
    ///
    /// Defaults to 1,024.
    #[must_use]
    pub fn with_flush_queue_capacity(mut self, flush_queue_capacity: usize) -> Self {
        self.flush_queue_capacity = flush_queue_capacity;
        self
    }

    /// Sets whether or not to enable telemetry for the engine.
    ///
    /// When enabled, counters describing the engine's own behavior, such as how many samples were buffered,
    /// dropped, or sent, are registered with the globally installed `metrics` recorder. Registration happens when
    /// the first sample is put, so the recorder can be installed after the engine is built.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        let reason = if self.flush_size == 0 {
            "flush size must be greater than zero"
        } else if self.max_buffer_size == 0 {
            "maximum buffer size must be greater than zero"
        } else if self.flush_workers == 0 {
            "at least one flush worker is required"
        } else if self.flush_queue_capacity == 0 {
            "flush queue capacity must be greater than zero"
        } else if self.max_payload_len == 0 || u32::try_from(self.max_payload_len).is_err() {
            "maximum payload length must be between 1 and 2^32 - 1 bytes"
        } else {
            return Ok(());
        };

        Err(BuildError::InvalidConfiguration { reason })
    }

    fn build_transport(&self) -> Result<Arc<dyn Transport>, BuildError> {
        match &self.destination {
            Destination::Remote(remote_addr) => Ok(Arc::new(UdpTransport::from_remote_addr(
                remote_addr.clone(),
                self.write_timeout,
                self.max_payload_len,
            ))),

            #[cfg(feature = "http")]
            Destination::Http(endpoint) => {
                crate::transport::HttpTransport::new(endpoint, self.write_timeout)
                    .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
                    .map_err(|e| BuildError::Transport { reason: e.to_string() })
            }

            Destination::Custom(transport) => Ok(Arc::clone(transport)),
        }
    }

    /// Builds the engine.
    ///
    /// The background flush threads are spawned immediately.
    ///
    /// # Errors
    ///
    /// If a configuration value is out of range, the transport cannot be created, or the background threads cannot be
    /// spawned, an error will be returned.
    pub fn build(self) -> Result<BufferedMetricsEngine, BuildError> {
        self.validate()?;
        let transport = self.build_transport()?;

        let config = EngineConfiguration {
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
            sample_rate: self.sample_rate,
            dry_run: self.dry_run,
            prefix: self.prefix,
            default_frequency: self.default_frequency,
            max_buffer_size: self.max_buffer_size,
            flush_workers: self.flush_workers,
            flush_queue_capacity: self.flush_queue_capacity,
            telemetry: self.telemetry,
        };

        BufferedMetricsEngine::start(config, transport)
    }
}

impl Default for LineExporterBuilder {
    fn default() -> Self {
        LineExporterBuilder {
            destination: Destination::Remote(RemoteAddr::Udp(vec![SocketAddr::from((
                [127, 0, 0, 1],
                8125,
            ))])),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            sample_rate: Some(DEFAULT_SAMPLE_RATE),
            dry_run: false,
            prefix: None,
            default_frequency: AggregationFrequency::Freq60,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            flush_workers: DEFAULT_FLUSH_WORKERS,
            flush_queue_capacity: DEFAULT_FLUSH_QUEUE_CAPACITY,
            telemetry: true,
        }
    }
}
