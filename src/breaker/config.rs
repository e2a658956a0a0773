//! Circuit breaker configuration.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use snafu::Snafu;

use super::listener::CircuitBreakerListener;
use super::ticker::{SystemTicker, Ticker};

/// Fully-qualified breaker name, used in logs and listener output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Name {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.namespace, self.subsystem, self.name)
    }
}

/// A configuration value failed validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The failure rate threshold must sit in `(0, 1]`.
    #[snafu(display("failure_rate_threshold: {value:.3} (expected: > 0 and <= 1)"))]
    FailureRateThreshold { value: f64 },

    /// A duration parameter must be positive.
    #[snafu(display("{field}: {value:?} (expected: > 0)"))]
    NonPositiveDuration {
        field: &'static str,
        value: Duration,
    },

    /// The sliding window must be longer than the update interval.
    #[snafu(display(
        "counter_sliding_window: {window:?} (expected: > counter_update_interval {interval:?})"
    ))]
    WindowNotAboveInterval { window: Duration, interval: Duration },
}

/// Settings for a [`CircuitBreaker`](super::CircuitBreaker).
///
/// Defaults match the behavior of the stock breaker: trip at an 80%
/// failure rate once at least 10 requests landed in the 20s sliding
/// window, stay open for 10s, and allow one trial every 3s in half-open.
///
/// ```
/// use resilient_client::breaker::CircuitBreakerConfig;
///
/// let config = CircuitBreakerConfig::builder()
///     .failure_rate_threshold(0.5)
///     .minimum_request_threshold(20)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Builder)]
pub struct CircuitBreakerConfig {
    /// Breaker name for logs and listeners.
    pub(super) name: Option<Name>,

    /// Time source. Swapped for a manual clock in tests.
    #[builder(default = Arc::new(SystemTicker))]
    pub(super) ticker: Arc<dyn Ticker>,

    /// Failure rate above which the circuit trips, in `(0, 1]`.
    #[builder(default = 0.8)]
    pub(super) failure_rate_threshold: f64,

    /// Minimum number of events in the window before the rate is
    /// trusted.
    #[builder(default = 10)]
    pub(super) minimum_request_threshold: i64,

    /// Interval between trial requests while half-open.
    #[builder(default = Duration::from_secs(3))]
    pub(super) trial_request_interval: Duration,

    /// How long the circuit stays open before probing.
    #[builder(default = Duration::from_secs(10))]
    pub(super) circuit_open_window: Duration,

    /// Length of the sliding window accumulating event counts.
    #[builder(default = Duration::from_secs(20))]
    pub(super) counter_sliding_window: Duration,

    /// How often the accumulated count is published.
    #[builder(default = Duration::from_secs(1))]
    pub(super) counter_update_interval: Duration,

    /// Listeners notified of state changes, count updates, and
    /// rejections.
    #[builder(default)]
    pub(super) listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Returns the breaker name, if set.
    pub fn name(&self) -> Option<&Name> {
        self.name.as_ref()
    }

    /// Checks every invariant, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_rate_threshold <= 0.0 || self.failure_rate_threshold > 1.0 {
            return FailureRateThresholdSnafu {
                value: self.failure_rate_threshold,
            }
            .fail();
        }
        for (field, value) in [
            ("trial_request_interval", self.trial_request_interval),
            ("circuit_open_window", self.circuit_open_window),
            ("counter_sliding_window", self.counter_sliding_window),
            ("counter_update_interval", self.counter_update_interval),
        ] {
            if value.is_zero() {
                return NonPositiveDurationSnafu { field, value }.fail();
            }
        }
        if self.counter_sliding_window <= self.counter_update_interval {
            return WindowNotAboveIntervalSnafu {
                window: self.counter_sliding_window,
                interval: self.counter_update_interval,
            }
            .fail();
        }
        Ok(())
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("minimum_request_threshold", &self.minimum_request_threshold)
            .field("trial_request_interval", &self.trial_request_interval)
            .field("circuit_open_window", &self.circuit_open_window)
            .field("counter_sliding_window", &self.counter_sliding_window)
            .field("counter_update_interval", &self.counter_update_interval)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        for value in [0.0, -0.5, 1.01] {
            let config = CircuitBreakerConfig::builder()
                .failure_rate_threshold(value)
                .build();
            assert!(matches!(
                config.validate(),
                Err(ConfigError::FailureRateThreshold { .. })
            ));
        }
        let config = CircuitBreakerConfig::builder()
            .failure_rate_threshold(1.0)
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_durations() {
        let config = CircuitBreakerConfig::builder()
            .circuit_open_window(Duration::ZERO)
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveDuration { field, .. }) if field == "circuit_open_window"
        ));
    }

    #[test]
    fn rejects_window_not_above_interval() {
        let config = CircuitBreakerConfig::builder()
            .counter_sliding_window(Duration::from_secs(1))
            .counter_update_interval(Duration::from_secs(1))
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WindowNotAboveInterval { .. })
        ));
    }

    #[test]
    fn name_displays_fully_qualified() {
        let name = Name {
            namespace: "payments".into(),
            subsystem: "api".into(),
            name: "orders".into(),
        };
        assert_eq!(name.to_string(), "payments_api_orders");
    }
}
