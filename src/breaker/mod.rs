//! Non-blocking circuit breaker.
//!
//! Tracks success/failure of remote invocations through a sliding-window
//! counter and trips when the failure rate crosses a threshold. All
//! state lives in an immutable record behind an atomic reference:
//! readers snapshot once per operation and transitions CAS-replace the
//! record, so the breaker never blocks and losers of a race simply
//! observe the winner's state.
//!
//! # States
//!
//! - **Closed**: requests pass; events feed a fresh sliding window.
//! - **Open**: requests fail fast until the open window elapses.
//! - **HalfOpen**: one trial request per trial interval; a success
//!   closes the circuit, a failure reopens it.
//!
//! Events are ignored while tripped; the trial request alone decides
//! re-closure. The breaker does not persist state: a restarted process
//! starts closed.

mod config;
mod counter;
mod listener;
mod ticker;

pub use config::{CircuitBreakerConfig, ConfigError, Name};
pub use counter::{EventCount, EventCounter, SlidingWindowCounter};
pub use listener::{CircuitBreakerListener, LoggingListener, MetricsListener};
pub use ticker::{SystemTicker, Ticker};

use std::sync::Arc;

use snafu::Snafu;

use crate::sync::AtomicRef;
use counter::NoopCounter;

/// State of a circuit breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// All requests are sent to the remote service.
    Closed,
    /// The circuit is tripped; requests fail immediately.
    Open,
    /// One trial request at a time probes the remote service.
    HalfOpen,
}

/// Fail-fast error surfaced by [`CircuitBreaker::execute`].
#[derive(Debug, Snafu)]
pub enum BreakerError {
    /// The breaker refused the request.
    #[snafu(display("circuit breaker is open; failing fast"))]
    FailFast,
}

enum StateCounter {
    Sliding(SlidingWindowCounter),
    Noop(NoopCounter),
}

impl StateCounter {
    fn count(&self) -> EventCount {
        match self {
            StateCounter::Sliding(c) => c.count(),
            StateCounter::Noop(c) => c.count(),
        }
    }

    fn on_success(&self) -> Option<EventCount> {
        match self {
            StateCounter::Sliding(c) => c.on_success(),
            StateCounter::Noop(c) => c.on_success(),
        }
    }

    fn on_failure(&self) -> Option<EventCount> {
        match self {
            StateCounter::Sliding(c) => c.on_failure(),
            StateCounter::Noop(c) => c.on_failure(),
        }
    }
}

/// Immutable per-state record; transitions swap the whole record.
struct BreakerState {
    state: CircuitState,
    counter: StateCounter,
    /// Zero while closed; the open/trial window length otherwise.
    window_nanos: i64,
    /// Tick at which the window elapses.
    deadline: i64,
}

impl BreakerState {
    fn timed_out(&self, now: i64) -> bool {
        self.window_nanos > 0 && self.deadline <= now
    }
}

/// A non-blocking circuit breaker.
///
/// ```
/// use resilient_client::breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())?;
/// if breaker.can_request() {
///     // ... perform the remote call ...
///     breaker.on_success();
/// }
/// # Ok::<(), resilient_client::breaker::ConfigError>(())
/// ```
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicRef<BreakerState>,
}

impl CircuitBreaker {
    /// Builds a breaker, validating the configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let breaker = Self {
            state: AtomicRef::new(Arc::new(Self::closed_state(&config))),
            config,
        };
        breaker.log_transition(CircuitState::Closed, None);
        breaker.notify_state_changed(CircuitState::Closed);
        Ok(breaker)
    }

    /// Returns the breaker name, if configured.
    pub fn name(&self) -> Option<&Name> {
        self.config.name()
    }

    /// Returns the current circuit state.
    pub fn current_state(&self) -> CircuitState {
        self.state.load().state
    }

    /// Returns the last published event count of the current state.
    pub fn event_count(&self) -> EventCount {
        self.state.load().counter.count()
    }

    /// Decides whether a request should be sent or failed fast.
    ///
    /// While open or half-open, the first caller past the deadline wins
    /// the transition to half-open and is granted the trial request.
    pub fn can_request(&self) -> bool {
        let current = self.state.load();
        match current.state {
            CircuitState::Closed => true,
            CircuitState::Open | CircuitState::HalfOpen => {
                if current.timed_out(self.config.ticker.tick())
                    && self
                        .state
                        .compare_exchange(&current, Arc::new(self.half_open_state()))
                {
                    self.log_transition(CircuitState::HalfOpen, None);
                    self.notify_state_changed(CircuitState::HalfOpen);
                    return true;
                }
                self.notify_request_rejected();
                false
            }
        }
    }

    /// Reports a successful remote invocation.
    pub fn on_success(&self) {
        let current = self.state.load();
        match current.state {
            CircuitState::Closed => {
                if let Some(count) = current.counter.on_success() {
                    self.notify_count_updated(count);
                }
            }
            CircuitState::HalfOpen => {
                // The trial succeeded; close the circuit.
                if self
                    .state
                    .compare_exchange(&current, Arc::new(Self::closed_state(&self.config)))
                {
                    self.log_transition(CircuitState::Closed, None);
                    self.notify_state_changed(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Reports a failed remote invocation.
    pub fn on_failure(&self) {
        let current = self.state.load();
        match current.state {
            CircuitState::Closed => {
                if let Some(count) = current.counter.on_failure() {
                    if self.exceeds_failure_threshold(count)
                        && self
                            .state
                            .compare_exchange(&current, Arc::new(self.open_state()))
                    {
                        self.log_transition(CircuitState::Open, Some(count));
                        self.notify_state_changed(CircuitState::Open);
                    } else {
                        self.notify_count_updated(count);
                    }
                }
            }
            CircuitState::HalfOpen => {
                // The trial failed; reopen.
                if self
                    .state
                    .compare_exchange(&current, Arc::new(self.open_state()))
                {
                    self.log_transition(CircuitState::Open, None);
                    self.notify_state_changed(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `fut` if the breaker admits the request, otherwise fails
    /// fast. The caller reports the outcome via
    /// [`on_success`](Self::on_success)/[`on_failure`](Self::on_failure)
    /// according to its own notion of failure.
    pub async fn execute<F, T>(&self, fut: F) -> Result<T, crate::Error>
    where
        F: std::future::Future<Output = Result<T, crate::Error>>,
    {
        if !self.can_request() {
            return Err(Box::new(BreakerError::FailFast));
        }
        fut.await
    }

    fn exceeds_failure_threshold(&self, count: EventCount) -> bool {
        let total = count.total();
        0 < total
            && self.config.minimum_request_threshold <= total
            && self.config.failure_rate_threshold < count.failure_rate()
    }

    fn closed_state(config: &CircuitBreakerConfig) -> BreakerState {
        BreakerState {
            state: CircuitState::Closed,
            counter: StateCounter::Sliding(SlidingWindowCounter::new_unchecked(
                Arc::clone(&config.ticker),
                config.counter_sliding_window,
                config.counter_update_interval,
            )),
            window_nanos: 0,
            deadline: config.ticker.tick(),
        }
    }

    fn open_state(&self) -> BreakerState {
        let window = self.config.circuit_open_window.as_nanos() as i64;
        BreakerState {
            state: CircuitState::Open,
            counter: StateCounter::Noop(NoopCounter),
            window_nanos: window,
            deadline: self.config.ticker.tick() + window,
        }
    }

    fn half_open_state(&self) -> BreakerState {
        let window = self.config.trial_request_interval.as_nanos() as i64;
        BreakerState {
            state: CircuitState::HalfOpen,
            counter: StateCounter::Noop(NoopCounter),
            window_nanos: window,
            deadline: self.config.ticker.tick() + window,
        }
    }

    fn log_transition(&self, state: CircuitState, count: Option<EventCount>) {
        match count {
            Some(count) => info!(
                name = self.config.name().map(|n| n.to_string()).unwrap_or_default(),
                state = ?state,
                failure = count.failure(),
                total = count.total(),
                "circuit state changed"
            ),
            None => info!(
                name = self.config.name().map(|n| n.to_string()).unwrap_or_default(),
                state = ?state,
                "circuit state changed"
            ),
        }
    }

    fn notify_state_changed(&self, state: CircuitState) {
        for listener in &self.config.listeners {
            if let Err(error) = listener.on_state_changed(self, state) {
                warn!(%error, "circuit breaker listener failed on state change");
            }
            if let Err(error) = listener.on_event_count_updated(self, EventCount::ZERO) {
                warn!(%error, "circuit breaker listener failed on count update");
            }
        }
    }

    fn notify_count_updated(&self, count: EventCount) {
        for listener in &self.config.listeners {
            if let Err(error) = listener.on_event_count_updated(self, count) {
                warn!(%error, "circuit breaker listener failed on count update");
            }
        }
    }

    fn notify_request_rejected(&self) {
        for listener in &self.config.listeners {
            if let Err(error) = listener.on_request_rejected(self) {
                warn!(%error, "circuit breaker listener failed on rejection");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name())
            .field("state", &self.current_state())
            .finish()
    }
}
