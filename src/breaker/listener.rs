//! Circuit breaker event listeners.

use super::counter::EventCount;
use super::{CircuitBreaker, CircuitState};

/// Receives circuit breaker events.
///
/// Listeners are user code: errors they return are logged and absorbed,
/// and they run on the task that performed the transition, so they must
/// not block beyond their own work.
pub trait CircuitBreakerListener: Send + Sync {
    /// The circuit state changed.
    fn on_state_changed(
        &self,
        breaker: &CircuitBreaker,
        state: CircuitState,
    ) -> Result<(), crate::Error>;

    /// A new event count was published.
    fn on_event_count_updated(
        &self,
        breaker: &CircuitBreaker,
        count: EventCount,
    ) -> Result<(), crate::Error>;

    /// The breaker refused a request.
    fn on_request_rejected(&self, breaker: &CircuitBreaker) -> Result<(), crate::Error>;

    /// The breaker is shutting the listener down.
    fn stop(&self) {}
}

/// Logs breaker events through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingListener;

impl CircuitBreakerListener for LoggingListener {
    fn on_state_changed(
        &self,
        breaker: &CircuitBreaker,
        state: CircuitState,
    ) -> Result<(), crate::Error> {
        info!(
            name = breaker.name().map(|n| n.to_string()).unwrap_or_default(),
            state = ?state,
            "circuit state changed"
        );
        Ok(())
    }

    fn on_event_count_updated(
        &self,
        breaker: &CircuitBreaker,
        count: EventCount,
    ) -> Result<(), crate::Error> {
        debug!(
            name = breaker.name().map(|n| n.to_string()).unwrap_or_default(),
            success = count.success(),
            failure = count.failure(),
            "event count updated"
        );
        Ok(())
    }

    fn on_request_rejected(&self, breaker: &CircuitBreaker) -> Result<(), crate::Error> {
        warn!(
            name = breaker.name().map(|n| n.to_string()).unwrap_or_default(),
            "request rejected by circuit breaker"
        );
        Ok(())
    }
}

/// Publishes breaker events as `metrics` counters and gauges.
///
/// Emits `circuit_breaker_state` (gauge, 0=closed 1=open 2=half-open),
/// `circuit_breaker_rejections_total`, `circuit_breaker_events_success`,
/// and `circuit_breaker_events_failure`, each labeled with the breaker
/// name.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsListener;

impl MetricsListener {
    fn label(breaker: &CircuitBreaker) -> String {
        breaker.name().map(|n| n.to_string()).unwrap_or_default()
    }
}

impl CircuitBreakerListener for MetricsListener {
    fn on_state_changed(
        &self,
        breaker: &CircuitBreaker,
        state: CircuitState,
    ) -> Result<(), crate::Error> {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        metrics::gauge!("circuit_breaker_state", "name" => Self::label(breaker)).set(value);
        Ok(())
    }

    fn on_event_count_updated(
        &self,
        breaker: &CircuitBreaker,
        count: EventCount,
    ) -> Result<(), crate::Error> {
        let name = Self::label(breaker);
        metrics::gauge!("circuit_breaker_events_success", "name" => name.clone())
            .set(count.success() as f64);
        metrics::gauge!("circuit_breaker_events_failure", "name" => name)
            .set(count.failure() as f64);
        Ok(())
    }

    fn on_request_rejected(&self, breaker: &CircuitBreaker) -> Result<(), crate::Error> {
        metrics::counter!("circuit_breaker_rejections_total", "name" => Self::label(breaker))
            .increment(1);
        Ok(())
    }
}
