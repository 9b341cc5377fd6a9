use metrics::{counter, Counter};

/// Exporter telemetry.
///
/// `Telemetry` tracks what happens to samples and payloads inside the exporter, and reports it as regular counters
/// through the [`metrics`] facade, so that it reaches whatever recorder the application has installed.
///
/// All counters live under the `metrics_exporter_line.client` namespace.
pub struct Telemetry {
    samples_buffered: Counter,
    samples_sampled_out: Counter,
    samples_invalid: Counter,
    samples_dropped: Counter,
    samples_evicted: Counter,
    flush_tasks_dropped: Counter,
    payloads_sent: Counter,
    payloads_failed: Counter,
    payloads_dry_run: Counter,
    lines_sent: Counter,
    bytes_sent: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new(transport: &'static str) -> Self {
        let base_labels = telemetry_tags!("client_transport" => transport);
        let standard_labels = telemetry_tags!("client_transport" => transport, "buffer" => "standard");
        let aggregated_labels =
            telemetry_tags!("client_transport" => transport, "buffer" => "aggregated");

        Self {
            samples_buffered: counter!(
                "metrics_exporter_line.client.samples_buffered",
                base_labels.iter()
            ),
            samples_sampled_out: counter!(
                "metrics_exporter_line.client.samples_sampled_out",
                base_labels.iter()
            ),
            samples_invalid: counter!(
                "metrics_exporter_line.client.samples_invalid",
                base_labels.iter()
            ),
            samples_dropped: counter!(
                "metrics_exporter_line.client.samples_dropped",
                standard_labels.iter()
            ),
            samples_evicted: counter!(
                "metrics_exporter_line.client.samples_dropped",
                aggregated_labels.iter()
            ),
            flush_tasks_dropped: counter!(
                "metrics_exporter_line.client.flush_tasks_dropped",
                base_labels.iter()
            ),
            payloads_sent: counter!("metrics_exporter_line.client.payloads_sent", base_labels.iter()),
            payloads_failed: counter!(
                "metrics_exporter_line.client.payloads_failed",
                base_labels.iter()
            ),
            payloads_dry_run: counter!(
                "metrics_exporter_line.client.payloads_dry_run",
                base_labels.iter()
            ),
            lines_sent: counter!("metrics_exporter_line.client.lines_sent", base_labels.iter()),
            bytes_sent: counter!("metrics_exporter_line.client.bytes_sent", base_labels.iter()),
        }
    }

    pub fn track_buffered(&self) {
        self.samples_buffered.increment(1);
    }

    pub fn track_sampled_out(&self) {
        self.samples_sampled_out.increment(1);
    }

    pub fn track_invalid(&self) {
        self.samples_invalid.increment(1);
    }

    /// Tracks a line that was rejected because the standard buffer was full.
    pub fn track_dropped(&self) {
        self.samples_dropped.increment(1);
    }

    /// Tracks a line that was evicted from a full aggregated buffer.
    pub fn track_evicted(&self) {
        self.samples_evicted.increment(1);
    }

    pub fn track_flush_task_dropped(&self) {
        self.flush_tasks_dropped.increment(1);
    }

    /// Tracks a payload that reached the transport successfully.
    pub fn track_payload_sent(&self, lines: usize, bytes: usize) {
        self.payloads_sent.increment(1);
        self.lines_sent.increment(lines as u64);
        self.bytes_sent.increment(bytes as u64);
    }

    pub fn track_payload_failed(&self) {
        self.payloads_failed.increment(1);
    }

    pub fn track_payload_dry_run(&self) {
        self.payloads_dry_run.increment(1);
    }
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("client", "rust"),
            ::metrics::Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;
