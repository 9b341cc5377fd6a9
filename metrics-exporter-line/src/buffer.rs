use std::sync::{
    atomic::{AtomicUsize, Ordering},
    OnceLock,
};

use crossbeam_queue::SegQueue;

use crate::sample::{AggregationFrequency, AggregationKey, AggregationKind};

const KIND_COUNT: usize = AggregationKind::ALL.len();
const FREQUENCY_COUNT: usize = AggregationFrequency::ALL.len();

/// A lock-free FIFO queue of encoded lines, holding at most `capacity` lines.
///
/// Storage grows with the number of queued lines, up to the capacity. `len` counts slots that have been reserved,
/// so a line is counted from the moment its push starts.
pub(crate) struct BoundedQueue {
    inner: SegQueue<String>,
    len: AtomicUsize,
    capacity: usize,
}

impl BoundedQueue {
    /// Creates a new `BoundedQueue` that holds at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        BoundedQueue { inner: SegQueue::new(), len: AtomicUsize::new(0), capacity }
    }

    fn try_reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    /// Pushes a line onto the back of the queue, handing it back if the queue is full.
    pub fn push(&self, line: String) -> Result<(), String> {
        if self.try_reserve() {
            self.inner.push(line);
            Ok(())
        } else {
            Err(line)
        }
    }

    /// Pushes a line onto the back of the queue, evicting and returning the oldest line if the queue is full.
    ///
    /// A queue with no capacity at all hands the line straight back.
    pub fn force_push(&self, line: String) -> Option<String> {
        if self.capacity == 0 {
            return Some(line);
        }

        loop {
            if self.try_reserve() {
                self.inner.push(line);
                return None;
            }

            // The evicted line's slot is handed over to the new line, so the length doesn't change.
            if let Some(evicted) = self.inner.pop() {
                self.inner.push(line);
                return Some(evicted);
            }

            // Full, but every reserved slot is still being pushed into by another thread.
            std::hint::spin_loop();
        }
    }

    /// Removes up to `limit` lines from the front of the queue, oldest first.
    ///
    /// Concurrent drains each receive a disjoint, ordered run of lines, so no line is ever handed out twice.
    pub fn drain(&self, limit: usize) -> Vec<String> {
        let mut lines = Vec::with_capacity(limit.min(self.len()));
        while lines.len() < limit {
            match self.inner.pop() {
                Some(line) => {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    lines.push(line);
                }
                None => break,
            }
        }
        lines
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_ready_to_flush(&self, flush_size: usize) -> bool {
        let len = self.len();
        len > 0 && len >= flush_size
    }
}

/// Buffer for lines of non-aggregated samples.
///
/// When the buffer is full, new lines are dropped: whatever is already queued is kept.
pub(crate) struct StandardBuffer {
    queue: BoundedQueue,
}

impl StandardBuffer {
    pub fn new(capacity: usize) -> Self {
        StandardBuffer { queue: BoundedQueue::new(capacity) }
    }

    /// Adds a line, returning `false` if the buffer was full and the line was dropped.
    pub fn add(&self, line: String) -> bool {
        self.queue.push(line).is_ok()
    }

    pub fn drain(&self, limit: usize) -> Vec<String> {
        self.queue.drain(limit)
    }

    pub fn is_ready_to_flush(&self, flush_size: usize) -> bool {
        self.queue.is_ready_to_flush(flush_size)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Buffer for lines of aggregated samples, holding one independent queue per aggregation kind and frequency.
///
/// Queues are created on first use and live as long as the buffer does. When a queue is full, its oldest line is
/// evicted to make room for the new one.
pub(crate) struct AggregatedBuffer {
    capacity: usize,
    slots: [[OnceLock<BoundedQueue>; FREQUENCY_COUNT]; KIND_COUNT],
}

impl AggregatedBuffer {
    pub fn new(capacity: usize) -> Self {
        AggregatedBuffer {
            capacity,
            slots: std::array::from_fn(|_| std::array::from_fn(|_| OnceLock::new())),
        }
    }

    fn slot(&self, key: AggregationKey) -> &OnceLock<BoundedQueue> {
        &self.slots[key.kind.index()][key.frequency.index()]
    }

    fn queue(&self, key: AggregationKey) -> Option<&BoundedQueue> {
        self.slot(key).get()
    }

    /// Adds a line to the queue for `key`, creating the queue if needed.
    ///
    /// Returns the evicted line if the queue was full.
    pub fn add(&self, key: AggregationKey, line: String) -> Option<String> {
        self.slot(key).get_or_init(|| BoundedQueue::new(self.capacity)).force_push(line)
    }

    pub fn drain(&self, key: AggregationKey, limit: usize) -> Vec<String> {
        self.queue(key).map(|queue| queue.drain(limit)).unwrap_or_default()
    }

    pub fn len(&self, key: AggregationKey) -> usize {
        self.queue(key).map_or(0, BoundedQueue::len)
    }

    /// Returns `true` if the queue for `key` holds at least `flush_size` lines.
    pub fn is_key_ready_to_flush(&self, key: AggregationKey, flush_size: usize) -> bool {
        self.queue(key).is_some_and(|queue| queue.is_ready_to_flush(flush_size))
    }

    /// Returns `true` if any queue holds at least `flush_size` lines.
    pub fn is_ready_to_flush(&self, flush_size: usize) -> bool {
        self.keys().any(|key| self.is_key_ready_to_flush(key, flush_size))
    }

    /// Returns the aggregation kinds that have at least one queue.
    pub fn kinds(&self) -> impl Iterator<Item = AggregationKind> + '_ {
        AggregationKind::ALL
            .into_iter()
            .filter(move |kind| self.slots[kind.index()].iter().any(|slot| slot.get().is_some()))
    }

    /// Returns the frequencies that have a queue for the given aggregation kind.
    pub fn frequencies(&self, kind: AggregationKind) -> impl Iterator<Item = AggregationFrequency> + '_ {
        AggregationFrequency::ALL
            .into_iter()
            .filter(move |frequency| self.slots[kind.index()][frequency.index()].get().is_some())
    }

    /// Returns the keys of all queues.
    pub fn keys(&self) -> impl Iterator<Item = AggregationKey> + '_ {
        self.kinds().flat_map(move |kind| {
            self.frequencies(kind).map(move |frequency| AggregationKey::new(kind, frequency))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::{AggregatedBuffer, BoundedQueue, StandardBuffer};
    use crate::sample::{
        AggregationFrequency::{self, Freq10, Freq120},
        AggregationKey,
        AggregationKind::{self, Avg, Count},
    };

    fn lines(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("line{i}")).collect()
    }

    #[test]
    fn standard_drops_newest_when_full() {
        let buffer = StandardBuffer::new(3);
        let results = lines(0..5).into_iter().map(|line| buffer.add(line)).collect::<Vec<_>>();

        assert_eq!(results, [true, true, true, false, false]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.drain(10), lines(0..3));
    }

    #[test]
    fn standard_drain_is_fifo_and_bounded() {
        let buffer = StandardBuffer::new(10);
        for line in lines(0..5) {
            assert!(buffer.add(line));
        }

        assert_eq!(buffer.drain(2), lines(0..2));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.drain(2), lines(2..4));
        assert_eq!(buffer.drain(2), lines(4..5));
        assert!(buffer.drain(2).is_empty());
    }

    #[test]
    fn standard_readiness() {
        let buffer = StandardBuffer::new(10);
        assert!(!buffer.is_ready_to_flush(3));
        // An empty buffer is never ready, even with a zero threshold.
        assert!(!buffer.is_ready_to_flush(0));

        for line in lines(0..2) {
            buffer.add(line);
        }
        assert!(!buffer.is_ready_to_flush(3));

        buffer.add("line2".to_string());
        assert!(buffer.is_ready_to_flush(3));
    }

    #[test]
    fn aggregated_evicts_oldest_when_full() {
        let key = AggregationKey::new(Avg, Freq10);
        let buffer = AggregatedBuffer::new(3);

        let evicted =
            lines(0..5).into_iter().filter_map(|line| buffer.add(key, line)).collect::<Vec<_>>();

        assert_eq!(evicted, lines(0..2));
        assert_eq!(buffer.drain(key, 10), lines(2..5));
    }

    #[test]
    fn aggregated_isolation() {
        let hot = AggregationKey::new(Avg, Freq10);
        let other_frequency = AggregationKey::new(Avg, Freq120);
        let other_kind = AggregationKey::new(Count, Freq10);

        let buffer = AggregatedBuffer::new(100);
        buffer.add(other_frequency, "slow".to_string());
        buffer.add(other_kind, "count".to_string());
        for line in lines(0..5) {
            buffer.add(hot, line);
        }

        assert!(buffer.is_ready_to_flush(3));
        assert!(buffer.is_key_ready_to_flush(hot, 3));
        assert!(!buffer.is_key_ready_to_flush(other_frequency, 3));
        assert!(!buffer.is_key_ready_to_flush(other_kind, 3));

        assert_eq!(buffer.drain(hot, 3), lines(0..3));
        assert_eq!(buffer.len(hot), 2);
        assert_eq!(buffer.len(other_frequency), 1);
        assert_eq!(buffer.len(other_kind), 1);
        assert!(!buffer.is_ready_to_flush(3));
    }

    #[test]
    fn aggregated_introspection() {
        let buffer = AggregatedBuffer::new(10);
        assert_eq!(buffer.keys().count(), 0);
        assert!(buffer.drain(AggregationKey::new(Avg, Freq10), 10).is_empty());

        buffer.add(AggregationKey::new(Count, Freq120), "a".to_string());
        buffer.add(AggregationKey::new(Avg, Freq10), "b".to_string());
        buffer.add(AggregationKey::new(Avg, Freq120), "c".to_string());

        assert_eq!(buffer.kinds().collect::<Vec<_>>(), [Avg, Count]);
        assert_eq!(buffer.frequencies(Avg).collect::<Vec<_>>(), [Freq10, Freq120]);
        assert_eq!(buffer.frequencies(Count).collect::<Vec<_>>(), [Freq120]);

        // Drained queues stay registered.
        buffer.drain(AggregationKey::new(Count, Freq120), 10);
        assert_eq!(buffer.keys().count(), 3);
    }

    #[test]
    fn aggregated_concurrent_creation() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;

        let key = AggregationKey::new(Avg, Freq10);
        let buffer = Arc::new(AggregatedBuffer::new(THREADS * PER_THREAD));

        let handles = (0..THREADS)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        assert!(buffer.add(key, format!("{t}-{i}")).is_none());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut drained = buffer.drain(key, usize::MAX);
        assert_eq!(drained.len(), THREADS * PER_THREAD);
        drained.sort();
        drained.dedup();
        assert_eq!(drained.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn storage_grows_with_contents() {
        // Nothing is allocated for capacity that isn't used, so even an absurd cap is fine for every key.
        let buffer = AggregatedBuffer::new(usize::MAX);
        for kind in AggregationKind::ALL {
            for frequency in AggregationFrequency::ALL {
                assert!(buffer.add(AggregationKey::new(kind, frequency), "x 1 1".to_string()).is_none());
            }
        }
        assert_eq!(buffer.keys().count(), 66);

        let standard = StandardBuffer::new(usize::MAX);
        assert!(standard.add("x 1 1".to_string()));
        assert_eq!(standard.len(), 1);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.push("a".to_string()), Err("a".to_string()));
        assert_eq!(queue.force_push("b".to_string()), Some("b".to_string()));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn concurrent_eviction_keeps_the_cap() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        const CAPACITY: usize = 16;

        let queue = Arc::new(BoundedQueue::new(CAPACITY));
        let handles = (0..THREADS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .filter_map(|i| queue.force_push(format!("{t}-{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }

        assert_eq!(queue.len(), CAPACITY);
        let remaining = queue.drain(usize::MAX);
        assert_eq!(remaining.len(), CAPACITY);
        assert_eq!(queue.len(), 0);

        seen.extend(remaining);
        assert_eq!(seen.len(), THREADS * PER_THREAD);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
