use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    builder::BuildError,
    sample::{AggregationFrequency, AggregationKey, MetricSample, MetricValue},
    sampler::Sampler,
    scheduler::{FlushScheduler, FlushTask, Flusher, SchedulerConfiguration, TaskSubmitter},
    transport::Transport,
    writer::{unix_timestamp, MessageEncoder},
};

/// Engine configuration.
///
/// Built once by [`LineExporterBuilder`][crate::LineExporterBuilder] and never changed afterwards.
#[derive(Clone, Debug)]
pub struct EngineConfiguration {
    pub(crate) flush_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) sample_rate: Option<i64>,
    pub(crate) dry_run: bool,
    pub(crate) prefix: Option<String>,
    pub(crate) default_frequency: AggregationFrequency,
    pub(crate) max_buffer_size: usize,
    pub(crate) flush_workers: usize,
    pub(crate) flush_queue_capacity: usize,
    pub(crate) telemetry: bool,
}

impl EngineConfiguration {
    /// Number of buffered lines that triggers an immediate flush of a buffer.
    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    /// Interval between periodic flushes of all buffers.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Sample rate applied to samples created with [`BufferedMetricsEngine::sample`].
    pub fn sample_rate(&self) -> Option<i64> {
        self.sample_rate
    }

    /// Whether payloads are logged instead of sent.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Namespace applied to samples created with [`BufferedMetricsEngine::sample`].
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Aggregation frequency applied to samples created with [`BufferedMetricsEngine::sample`].
    pub fn default_frequency(&self) -> AggregationFrequency {
        self.default_frequency
    }

    /// Maximum number of lines held by each buffer.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }
}

/// What happened to a sample handed to [`BufferedMetricsEngine::put`].
///
/// Only [`PutOutcome::Buffered`] means the sample will be sent. Every other outcome means the sample was lost, which
/// has already been logged: callers are free to ignore the outcome entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The sample was encoded and buffered.
    Buffered,

    /// The sample was not admitted by the sampler.
    SampledOut,

    /// The sample has an empty name or value.
    Invalid,

    /// The buffer was full and the sample was dropped.
    Dropped,

    /// The engine has been shut down.
    ShutDown,
}

/// Buffers encoded metric samples and flushes them to a transport.
///
/// Samples are sampled, encoded and inserted into either the standard buffer, or, for samples with aggregations, the
/// aggregated sub-buffer for their primary aggregation kind and frequency. A buffer that reaches the flush size is
/// flushed in the background straight away, and all buffers are flushed at every flush interval.
///
/// None of the producer-facing methods block or fail: metrics that cannot be buffered or sent are logged and lost.
pub struct BufferedMetricsEngine {
    config: EngineConfiguration,
    sampler: Sampler,
    encoder: MessageEncoder,
    flusher: Arc<Flusher>,
    submitter: TaskSubmitter,
    scheduler: Mutex<Option<FlushScheduler>>,
    running: AtomicBool,
}

impl BufferedMetricsEngine {
    pub(crate) fn start(
        config: EngineConfiguration,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BuildError> {
        let flusher = Arc::new(Flusher::new(
            config.max_buffer_size,
            config.flush_size,
            config.dry_run,
            transport,
            config.telemetry,
        ));

        let scheduler_config = SchedulerConfiguration {
            flush_interval: config.flush_interval,
            workers: config.flush_workers,
            queue_capacity: config.flush_queue_capacity,
        };
        let scheduler = FlushScheduler::start(&flusher, &scheduler_config)
            .map_err(|e| BuildError::Backend { reason: e.to_string() })?;

        debug!(
            flush_size = config.flush_size,
            flush_interval = ?config.flush_interval,
            max_buffer_size = config.max_buffer_size,
            dry_run = config.dry_run,
            "Started metrics engine."
        );

        Ok(BufferedMetricsEngine {
            config,
            sampler: Sampler::new(),
            encoder: MessageEncoder::new(),
            submitter: scheduler.submitter(),
            flusher,
            scheduler: Mutex::new(Some(scheduler)),
            running: AtomicBool::new(true),
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    /// Creates a sample with the engine's defaults: the configured sample rate, the prefix as namespace, and the
    /// default aggregation frequency.
    pub fn sample<N, V>(&self, name: N, value: V) -> MetricSample
    where
        N: Into<String>,
        V: Into<MetricValue>,
    {
        let sample = MetricSample::new(name, value)
            .with_sample_rate(self.config.sample_rate)
            .with_frequency(self.config.default_frequency);

        match &self.config.prefix {
            Some(prefix) => sample.with_namespace(prefix.clone()),
            None => sample,
        }
    }

    /// Samples, encodes and buffers a metric sample.
    ///
    /// If buffering the sample fills its buffer up to the flush size, a background flush of that buffer is
    /// requested.
    pub fn put(&self, sample: &MetricSample) -> PutOutcome {
        if !self.running.load(Ordering::Acquire) {
            trace!(metric_name = sample.name(), "Engine is shut down, ignoring sample.");
            return PutOutcome::ShutDown;
        }

        let telemetry = self.flusher.telemetry();

        if !self.sampler.should_admit(sample.sample_rate()) {
            trace!(metric_name = sample.name(), "Sample not admitted by sampler.");
            if let Some(telemetry) = telemetry {
                telemetry.track_sampled_out();
            }
            return PutOutcome::SampledOut;
        }

        let line = match self.encoder.encode_at(sample, unix_timestamp()) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Invalid metric sample, dropping.");
                if let Some(telemetry) = telemetry {
                    telemetry.track_invalid();
                }
                return PutOutcome::Invalid;
            }
        };

        let outcome = match sample.aggregation_key() {
            Some(key) => self.put_aggregated(key, line),
            None => self.put_standard(line),
        };

        if outcome == PutOutcome::Buffered {
            if let Some(telemetry) = telemetry {
                telemetry.track_buffered();
            }
        }

        outcome
    }

    fn put_standard(&self, line: String) -> PutOutcome {
        let standard = self.flusher.standard();
        if !standard.add(line) {
            warn!(
                max_buffer_size = self.config.max_buffer_size,
                "Buffer is full, dropping metric."
            );
            if let Some(telemetry) = self.flusher.telemetry() {
                telemetry.track_dropped();
            }
            return PutOutcome::Dropped;
        }

        if standard.is_ready_to_flush(self.config.flush_size) {
            self.submitter.submit(FlushTask::Standard, &self.flusher);
        }

        PutOutcome::Buffered
    }

    fn put_aggregated(&self, key: AggregationKey, line: String) -> PutOutcome {
        let aggregated = self.flusher.aggregated();
        if let Some(evicted) = aggregated.add(key, line) {
            warn!(
                aggregation = %key.kind,
                frequency = %key.frequency,
                max_buffer_size = self.config.max_buffer_size,
                %evicted,
                "Aggregated buffer is full, evicted oldest metric."
            );
            if let Some(telemetry) = self.flusher.telemetry() {
                telemetry.track_evicted();
            }
        }

        if aggregated.is_key_ready_to_flush(key, self.config.flush_size) {
            self.submitter.submit(FlushTask::Aggregated(key), &self.flusher);
        }

        PutOutcome::Buffered
    }

    /// Flushes every non-empty buffer on the calling thread, blocking until the transport has been called for each
    /// batch.
    ///
    /// Does nothing once the engine has been shut down.
    pub fn force_sync_flush(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let batches = self.flusher.flush_all();
        debug!(batches, "Forced synchronous flush.");
    }

    /// Shuts the engine down.
    ///
    /// Stops the periodic timer and the flush workers, flushes whatever is left in the buffers, and shuts the
    /// transport down. Samples put after shutdown are ignored. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        let batches = self.flusher.flush_all();
        self.flusher.shutdown_transport();

        info!(batches, "Metrics engine shut down.");
    }

    /// Returns `true` until [`shutdown`][Self::shutdown] has been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the number of lines waiting in the standard buffer.
    pub fn buffered_len(&self) -> usize {
        self.flusher.standard().len()
    }

    /// Returns the number of lines waiting in the aggregated sub-buffer for `key`.
    pub fn aggregated_buffered_len(&self, key: AggregationKey) -> usize {
        self.flusher.aggregated().len(key)
    }

    /// Returns the keys of every aggregated sub-buffer created so far.
    pub fn aggregation_keys(&self) -> Vec<AggregationKey> {
        self.flusher.aggregated().keys().collect()
    }

    /// Returns `true` if the standard buffer or any aggregated sub-buffer has reached the flush size.
    pub fn is_ready_to_flush(&self) -> bool {
        let flush_size = self.flusher.flush_size();
        self.flusher.standard().is_ready_to_flush(flush_size)
            || self.flusher.aggregated().is_ready_to_flush(flush_size)
    }
}

impl Drop for BufferedMetricsEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
