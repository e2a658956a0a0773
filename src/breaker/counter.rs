//! Sliding-window success/failure counting.
//!
//! Events land in the *current bucket*, a pair of striped adders stamped
//! with its creation time. Once an update interval elapses, the next
//! event rolls the bucket: the winner of the CAS pushes the old bucket
//! into a lock-free reservoir, drops buckets older than the window,
//! sums the rest, and publishes the result as the new snapshot. Reads
//! are a single atomic load of that snapshot.

use std::sync::Arc;
use std::time::Duration;

use crate::adder::LongAdder;
use crate::queue::LinkedQueue;
use crate::sync::AtomicRef;

use super::ticker::Ticker;

/// An immutable success/failure tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCount {
    success: i64,
    failure: i64,
}

impl EventCount {
    /// The all-zero count.
    pub const ZERO: EventCount = EventCount {
        success: 0,
        failure: 0,
    };

    /// Creates a count.
    pub const fn new(success: i64, failure: i64) -> Self {
        Self { success, failure }
    }

    /// Number of successes.
    pub const fn success(&self) -> i64 {
        self.success
    }

    /// Number of failures.
    pub const fn failure(&self) -> i64 {
        self.failure
    }

    /// Total number of events.
    pub const fn total(&self) -> i64 {
        self.success + self.failure
    }

    /// Fraction of successes, or `-1.0` when the total is zero.
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            -1.0
        } else {
            self.success as f64 / total as f64
        }
    }

    /// Fraction of failures, or `-1.0` when the total is zero.
    pub fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            -1.0
        } else {
            self.failure as f64 / total as f64
        }
    }
}

/// Counts success/failure events and reports snapshot updates.
pub trait EventCounter: Send + Sync {
    /// The last published count.
    fn count(&self) -> EventCount;

    /// Records a success. Returns the freshly published count when the
    /// event caused a snapshot update.
    fn on_success(&self) -> Option<EventCount>;

    /// Records a failure. Returns the freshly published count when the
    /// event caused a snapshot update.
    fn on_failure(&self) -> Option<EventCount>;
}

/// Event tallies within one update interval.
struct Bucket {
    timestamp: i64,
    success: LongAdder,
    failure: LongAdder,
}

impl Bucket {
    fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            success: LongAdder::new(),
            failure: LongAdder::new(),
        }
    }

    fn add(&self, success: bool) {
        if success {
            self.success.inc();
        } else {
            self.failure.inc();
        }
    }
}

/// Accumulates the count of events within a rolling time window.
pub struct SlidingWindowCounter {
    ticker: Arc<dyn Ticker>,
    window_nanos: i64,
    update_interval_nanos: i64,
    current: AtomicRef<Bucket>,
    snapshot: AtomicRef<EventCount>,
    reservoir: LinkedQueue<Arc<Bucket>>,
}

impl SlidingWindowCounter {
    /// Creates a counter; `window` must exceed `update_interval` and
    /// both must be positive.
    pub fn new(
        ticker: Arc<dyn Ticker>,
        window: Duration,
        update_interval: Duration,
    ) -> Result<Self, super::ConfigError> {
        if window.is_zero() {
            return super::config::NonPositiveDurationSnafu {
                field: "counter_sliding_window",
                value: window,
            }
            .fail();
        }
        if update_interval.is_zero() {
            return super::config::NonPositiveDurationSnafu {
                field: "counter_update_interval",
                value: update_interval,
            }
            .fail();
        }
        if window <= update_interval {
            return super::config::WindowNotAboveIntervalSnafu {
                window,
                interval: update_interval,
            }
            .fail();
        }
        Ok(Self::new_unchecked(ticker, window, update_interval))
    }

    /// Creates a counter from parameters already validated by
    /// [`CircuitBreakerConfig::validate`](super::CircuitBreakerConfig::validate).
    pub(super) fn new_unchecked(
        ticker: Arc<dyn Ticker>,
        window: Duration,
        update_interval: Duration,
    ) -> Self {
        let now = ticker.tick();
        Self {
            ticker,
            window_nanos: window.as_nanos() as i64,
            update_interval_nanos: update_interval.as_nanos() as i64,
            current: AtomicRef::new(Arc::new(Bucket::new(now))),
            snapshot: AtomicRef::new(Arc::new(EventCount::ZERO)),
            reservoir: LinkedQueue::new(),
        }
    }

    fn on_event(&self, success: bool) -> Option<EventCount> {
        let now = self.ticker.tick();
        let current = self.current.load();

        if now < current.timestamp {
            // The clock ran behind the current bucket (reordered tick or
            // a stalled thread). Record the event in an instant bucket so
            // it is not lost, without touching the snapshot.
            let instant = Bucket::new(now);
            instant.add(success);
            self.reservoir.offer(Arc::new(instant));
            return None;
        }

        if now < current.timestamp + self.update_interval_nanos {
            // Still accumulating in the current bucket.
            current.add(success);
            return None;
        }

        let next = Bucket::new(now);
        next.add(success);
        let next = Arc::new(next);

        if self.current.compare_exchange(&current, Arc::clone(&next)) {
            // Age out the replaced bucket, then publish a new snapshot.
            self.reservoir.offer(current);
            let count = self.trim_and_sum(now);
            self.snapshot.store(Arc::new(count));
            Some(count)
        } else {
            // Another event already rolled the bucket; keep ours as an
            // instant bucket so the event is not lost.
            self.reservoir.offer(next);
            None
        }
    }

    /// Drops buckets that slid out of the window and sums the rest.
    fn trim_and_sum(&self, now: i64) -> EventCount {
        let old_limit = now - self.window_nanos;
        let mut success = 0i64;
        let mut failure = 0i64;

        let mut iter = self.reservoir.iter();
        while let Some(bucket) = iter.next() {
            if bucket.timestamp < old_limit {
                iter.remove();
            } else {
                success += bucket.success.sum();
                failure += bucket.failure.sum();
            }
        }

        EventCount::new(success, failure)
    }
}

impl EventCounter for SlidingWindowCounter {
    fn count(&self) -> EventCount {
        *self.snapshot.load()
    }

    fn on_success(&self) -> Option<EventCount> {
        self.on_event(true)
    }

    fn on_failure(&self) -> Option<EventCount> {
        self.on_event(false)
    }
}

impl std::fmt::Debug for SlidingWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowCounter")
            .field("window_nanos", &self.window_nanos)
            .field("update_interval_nanos", &self.update_interval_nanos)
            .field("count", &self.count())
            .finish()
    }
}

/// Discards every event; used while the circuit is tripped.
#[derive(Debug, Default)]
pub(super) struct NoopCounter;

impl EventCounter for NoopCounter {
    fn count(&self) -> EventCount {
        EventCount::ZERO
    }

    fn on_success(&self) -> Option<EventCount> {
        None
    }

    fn on_failure(&self) -> Option<EventCount> {
        None
    }
}
