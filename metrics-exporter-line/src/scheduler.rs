use std::{
    io,
    sync::{Arc, OnceLock},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, trace};

use crate::{
    buffer::{AggregatedBuffer, StandardBuffer},
    sample::AggregationKey,
    telemetry::Telemetry,
    transport::Transport,
};

/// Flush intervals shorter than this disable periodic flushing.
pub(crate) const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// A unit of flush work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlushTask {
    /// Flush full batches from the standard buffer.
    Standard,

    /// Flush full batches from a single aggregated sub-buffer.
    Aggregated(AggregationKey),

    /// Flush everything, regardless of fill level.
    All,
}

/// Drains buffers and hands batches to the transport.
///
/// The flusher owns the buffers, so it can be shared between the engine, which fills them, and the flush workers,
/// which empty them.
pub(crate) struct Flusher {
    standard: StandardBuffer,
    aggregated: AggregatedBuffer,
    transport: Arc<dyn Transport>,
    flush_size: usize,
    dry_run: bool,
    telemetry_enabled: bool,
    telemetry: OnceLock<Telemetry>,
}

impl Flusher {
    pub fn new(
        max_buffer_size: usize,
        flush_size: usize,
        dry_run: bool,
        transport: Arc<dyn Transport>,
        telemetry_enabled: bool,
    ) -> Self {
        Flusher {
            standard: StandardBuffer::new(max_buffer_size),
            aggregated: AggregatedBuffer::new(max_buffer_size),
            transport,
            flush_size,
            dry_run,
            telemetry_enabled,
            telemetry: OnceLock::new(),
        }
    }

    pub fn standard(&self) -> &StandardBuffer {
        &self.standard
    }

    pub fn aggregated(&self) -> &AggregatedBuffer {
        &self.aggregated
    }

    /// Returns the exporter telemetry, registering its counters on first use.
    ///
    /// Registration is deferred until samples start flowing, so that an application that installs its recorder after
    /// building the engine still gets the telemetry.
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry_enabled
            .then(|| self.telemetry.get_or_init(|| Telemetry::new(self.transport.transport_id())))
    }

    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    /// Runs a flush task to completion on the calling thread.
    pub fn run(&self, task: FlushTask) {
        trace!(?task, "Running flush task.");
        match task {
            FlushTask::Standard => self.flush_ready_standard(),
            FlushTask::Aggregated(key) => self.flush_ready_aggregated(key),
            FlushTask::All => {
                self.flush_all();
            }
        }
    }

    // Several tasks may be queued for the same buffer, so each one re-checks readiness and the later ones become
    // no-ops once the earlier ones have drained the full batches.
    fn flush_ready_standard(&self) {
        while self.standard.is_ready_to_flush(self.flush_size) {
            let batch = self.standard.drain(self.flush_size);
            if batch.is_empty() {
                break;
            }
            self.send_batch(&batch, None);
        }
    }

    fn flush_ready_aggregated(&self, key: AggregationKey) {
        while self.aggregated.is_key_ready_to_flush(key, self.flush_size) {
            let batch = self.aggregated.drain(key, self.flush_size);
            if batch.is_empty() {
                break;
            }
            self.send_batch(&batch, Some(key));
        }
    }

    /// Drains every buffer, sending the contents in batches of at most the flush size.
    ///
    /// Lines inserted while the flush is running may be left for the next flush. Returns the number of batches that
    /// were handed to the transport, or logged in dry-run mode.
    pub fn flush_all(&self) -> usize {
        let mut batches = 0;

        let mut remaining = self.standard.len();
        while remaining > 0 {
            let batch = self.standard.drain(remaining.min(self.flush_size));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());
            self.send_batch(&batch, None);
            batches += 1;
        }

        for key in self.aggregated.keys() {
            let mut remaining = self.aggregated.len(key);
            while remaining > 0 {
                let batch = self.aggregated.drain(key, remaining.min(self.flush_size));
                if batch.is_empty() {
                    break;
                }
                remaining = remaining.saturating_sub(batch.len());
                self.send_batch(&batch, Some(key));
                batches += 1;
            }
        }

        if batches > 0 {
            debug!(batches, "Flushed all buffers.");
        }

        batches
    }

    fn send_batch(&self, batch: &[String], key: Option<AggregationKey>) {
        let payload = batch.join("\n");

        if self.dry_run {
            info!(lines = batch.len(), %payload, "Dry run enabled, not sending payload.");
            if let Some(telemetry) = self.telemetry() {
                telemetry.track_payload_dry_run();
            }
            return;
        }

        let result = match key {
            Some(key) => self.transport.send_to(&payload, &key.destination()),
            None => self.transport.send(&payload),
        };

        match result {
            Ok(()) => {
                trace!(lines = batch.len(), bytes = payload.len(), "Sent payload.");
                if let Some(telemetry) = self.telemetry() {
                    telemetry.track_payload_sent(batch.len(), payload.len());
                }
            }
            Err(e) => {
                error!(error = %e, lines = batch.len(), "Failed to send payload.");
                if let Some(telemetry) = self.telemetry() {
                    telemetry.track_payload_failed();
                }
            }
        }
    }

    pub fn shutdown_transport(&self) {
        self.transport.shutdown();
    }
}

/// Hands flush tasks to the workers without ever blocking.
#[derive(Clone)]
pub(crate) struct TaskSubmitter {
    tasks: Sender<FlushTask>,
}

impl TaskSubmitter {
    /// Submits a task, returning `false` if it was dropped because the task queue was full or closed.
    pub fn submit(&self, task: FlushTask, flusher: &Flusher) -> bool {
        match self.tasks.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                debug!(?task, "Flush task queue is full, dropping flush task.");
                if let Some(telemetry) = flusher.telemetry() {
                    telemetry.track_flush_task_dropped();
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Scheduler configuration.
pub(crate) struct SchedulerConfiguration {
    pub flush_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Runs flush tasks on a small pool of worker threads, and submits a full flush at every flush interval.
pub(crate) struct FlushScheduler {
    submitter: TaskSubmitter,
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Spawns the worker threads and, if the flush interval allows it, the timer thread.
    pub fn start(flusher: &Arc<Flusher>, config: &SchedulerConfiguration) -> io::Result<Self> {
        let (tasks_tx, tasks_rx) = bounded(config.queue_capacity);

        // Nothing is ever sent on this channel: dropping the sender is what tells the threads to stop.
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let submitter = TaskSubmitter { tasks: tasks_tx };
        let mut threads = Vec::with_capacity(config.workers + 1);

        for id in 0..config.workers {
            let flusher = Arc::clone(flusher);
            let tasks = tasks_rx.clone();
            let stop = stop_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("metrics-exporter-line-flush-{id}"))
                .spawn(move || run_worker(&flusher, &tasks, &stop))?;
            threads.push(handle);
        }

        if config.flush_interval >= MIN_FLUSH_INTERVAL {
            let flusher = Arc::clone(flusher);
            let submitter = submitter.clone();
            let interval = config.flush_interval;
            let handle = thread::Builder::new()
                .name("metrics-exporter-line-timer".to_string())
                .spawn(move || run_timer(&flusher, &submitter, interval, &stop_rx))?;
            threads.push(handle);
        } else {
            debug!(
                flush_interval = ?config.flush_interval,
                "Flush interval below {:?}, periodic flushing disabled.",
                MIN_FLUSH_INTERVAL
            );
        }

        Ok(FlushScheduler { submitter, stop: Some(stop_tx), threads })
    }

    pub fn submitter(&self) -> TaskSubmitter {
        self.submitter.clone()
    }

    /// Stops the timer and the workers, waiting for any in-flight flush to finish.
    ///
    /// Tasks still queued are discarded.
    pub fn stop(&mut self) {
        drop(self.stop.take());

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Flush thread panicked.");
            }
        }
    }
}

fn run_worker(flusher: &Flusher, tasks: &Receiver<FlushTask>, stop: &Receiver<()>) {
    loop {
        select! {
            recv(tasks) -> task => match task {
                Ok(task) => flusher.run(task),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }

    trace!("Flush worker stopped.");
}

fn run_timer(flusher: &Flusher, submitter: &TaskSubmitter, interval: Duration, stop: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                submitter.submit(FlushTask::All, flusher);
            },
            recv(stop) -> _ => break,
        }
    }

    trace!("Flush timer stopped.");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
    use parking_lot::Mutex;

    use super::{FlushScheduler, FlushTask, Flusher, SchedulerConfiguration};
    use crate::{
        sample::{AggregationFrequency, AggregationKey, AggregationKind},
        transport::{Transport, TransportError},
    };

    #[derive(Default)]
    struct Recorded {
        sent: Mutex<Vec<(Option<String>, String)>>,
    }

    impl Transport for Recorded {
        fn send(&self, payload: &str) -> Result<(), TransportError> {
            self.sent.lock().push((None, payload.to_string()));
            Ok(())
        }

        fn send_to(&self, payload: &str, destination: &str) -> Result<(), TransportError> {
            self.sent.lock().push((Some(destination.to_string()), payload.to_string()));
            Ok(())
        }
    }

    struct Failing;

    impl Transport for Failing {
        fn send(&self, _: &str) -> Result<(), TransportError> {
            Err(TransportError::Request { reason: "collector unavailable".to_string() })
        }
    }

    fn flusher(transport: Arc<dyn Transport>, flush_size: usize) -> Flusher {
        Flusher::new(100, flush_size, false, transport, false)
    }

    #[test]
    fn ready_flush_sends_full_batches_only() {
        let transport = Arc::new(Recorded::default());
        let flusher = flusher(transport.clone(), 2);
        for line in ["a 1 1", "b 2 2", "c 3 3", "d 4 4", "e 5 5"] {
            flusher.standard().add(line.to_string());
        }

        flusher.run(FlushTask::Standard);
        // A redundant task is a no-op.
        flusher.run(FlushTask::Standard);

        let sent = transport.sent.lock().clone();
        assert_eq!(
            sent,
            [(None, "a 1 1\nb 2 2".to_string()), (None, "c 3 3\nd 4 4".to_string())]
        );
        assert_eq!(flusher.standard().len(), 1);
    }

    #[test]
    fn flush_all_sends_partial_batches_per_destination() {
        let transport = Arc::new(Recorded::default());
        let flusher = flusher(transport.clone(), 2);
        let avg = AggregationKey::new(AggregationKind::Avg, AggregationFrequency::Freq10);

        flusher.standard().add("a 1 1".to_string());
        flusher.aggregated().add(avg, "b 2 2 avg,10".to_string());
        flusher.aggregated().add(avg, "c 3 3 avg,10".to_string());
        flusher.aggregated().add(avg, "d 4 4 avg,10".to_string());

        assert_eq!(flusher.flush_all(), 3);

        let sent = transport.sent.lock().clone();
        assert_eq!(
            sent,
            [
                (None, "a 1 1".to_string()),
                (Some("avg/10".to_string()), "b 2 2 avg,10\nc 3 3 avg,10".to_string()),
                (Some("avg/10".to_string()), "d 4 4 avg,10".to_string()),
            ]
        );

        // Nothing left, so nothing is sent.
        assert_eq!(flusher.flush_all(), 0);
        assert_eq!(transport.sent.lock().len(), 3);
    }

    #[test]
    fn transport_failure_loses_batch() {
        let flusher = flusher(Arc::new(Failing), 1);
        flusher.standard().add("a 1 1".to_string());

        assert_eq!(flusher.flush_all(), 1);
        assert_eq!(flusher.standard().len(), 0);
    }

    // Parks the calling worker in `send` until the test releases it.
    struct Stalled {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Transport for Stalled {
        fn send(&self, _: &str) -> Result<(), TransportError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }
    }

    #[test]
    fn saturated_queue_drops_tasks() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let transport = Arc::new(Stalled { entered: entered_tx, release: release_rx });

        let flusher = Arc::new(flusher(transport, 1));
        flusher.standard().add("a 1 1".to_string());

        let config = SchedulerConfiguration {
            flush_interval: Duration::ZERO,
            workers: 1,
            queue_capacity: 1,
        };
        let mut scheduler = FlushScheduler::start(&flusher, &config).unwrap();
        let submitter = scheduler.submitter();

        // Occupy the only worker.
        assert!(submitter.submit(FlushTask::Standard, &flusher));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the queue, then overflow it.
        assert!(submitter.submit(FlushTask::All, &flusher));
        assert!(matches!(submitter.tasks.try_send(FlushTask::All), Err(TrySendError::Full(_))));
        assert!(!submitter.submit(FlushTask::All, &flusher));

        drop(release_tx);
        scheduler.stop();
    }

    #[test]
    fn periodic_flush() {
        let transport = Arc::new(Recorded::default());
        let flusher = Arc::new(flusher(transport.clone(), 10));
        let config = SchedulerConfiguration {
            flush_interval: Duration::from_millis(50),
            workers: 1,
            queue_capacity: 16,
        };

        let mut scheduler = FlushScheduler::start(&flusher, &config).unwrap();
        flusher.standard().add("a 1 1".to_string());

        std::thread::sleep(Duration::from_millis(400));
        scheduler.stop();

        assert_eq!(flusher.standard().len(), 0);
        assert_eq!(transport.sent.lock().clone(), [(None, "a 1 1".to_string())]);
    }
}
