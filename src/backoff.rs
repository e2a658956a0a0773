//! Backoff strategies for retry loops.
//!
//! A [`Backoff`] is a pure delay calculator: given the number of
//! attempts made so far it returns how long to wait before the next one,
//! or a negative value to stop retrying. Strategies compose through
//! wrappers (jitter, attempt limit) built with [`BackoffBuilder`], and a
//! compact spec grammar covers the common cases in configuration files:
//!
//! ```text
//! exponential=initialDelayMillis:maxDelayMillis:multiplier
//! fixed=delayMillis
//! random=minDelayMillis:maxDelayMillis
//! ```
//!
//! Blank fields keep their defaults, so `"exponential=::3"` is the stock
//! exponential backoff with the multiplier raised to 3.

use std::sync::Arc;

use rand::Rng;
use snafu::{ResultExt, Snafu};

/// Default delay for [`FixedBackoff`], in milliseconds.
pub const DEFAULT_DELAY_MILLIS: i64 = 200;
/// Default initial delay for [`ExponentialBackoff`], in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MILLIS: i64 = 200;
/// Default delay cap for [`ExponentialBackoff`], in milliseconds.
pub const DEFAULT_MAX_DELAY_MILLIS: i64 = 10_000;
/// Default multiplier for [`ExponentialBackoff`].
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default lower bound for [`RandomBackoff`], in milliseconds.
pub const DEFAULT_MIN_DELAY_MILLIS: i64 = 0;
/// Default upper bound for [`RandomBackoff`], in milliseconds.
pub const DEFAULT_RANDOM_MAX_DELAY_MILLIS: i64 = 200;

/// Controls the wait between attempts of a single retry operation.
pub trait Backoff: Send + Sync {
    /// Milliseconds to wait before the next attempt, given the number of
    /// attempts so far (1 after the first attempt). A negative return
    /// means "do not retry".
    fn next_delay_millis(&self, attempts_so_far: u32) -> i64;
}

/// Invalid backoff parameters or specification.
#[derive(Debug, Snafu)]
pub enum BackoffError {
    /// The spec string did not match the grammar.
    #[snafu(display("invalid backoff specification: {spec:?}"))]
    InvalidSpec { spec: String },

    /// A numeric field in the spec failed to parse.
    #[snafu(display("invalid integer {text:?} in backoff specification"))]
    InvalidInt {
        text: String,
        source: std::num::ParseIntError,
    },

    /// The multiplier field in the spec failed to parse.
    #[snafu(display("invalid float {text:?} in backoff specification"))]
    InvalidFloat {
        text: String,
        source: std::num::ParseFloatError,
    },

    /// A delay must not be negative.
    #[snafu(display("{field}: {value} (expected: >= 0)"))]
    NegativeDelay { field: &'static str, value: i64 },

    /// The exponential multiplier must exceed 1.
    #[snafu(display("multiplier: {value:.3} (expected: > 1.0)"))]
    InvalidMultiplier { value: f64 },

    /// A delay range must satisfy `min <= max`.
    #[snafu(display("max_delay_millis: {max} (expected: >= {min})"))]
    DelayOrder { min: i64, max: i64 },

    /// Jitter rates must sit in `[-1, 1]`.
    #[snafu(display("jitter rate: {value:.3} (expected: >= -1.0 and <= 1.0)"))]
    InvalidJitterRate { value: f64 },

    /// Jitter rates must satisfy `min <= max`.
    #[snafu(display(
        "max_jitter_rate: {max:.3} (expected: >= min_jitter_rate {min:.3})"
    ))]
    JitterOrder { min: f64, max: f64 },

    /// The attempt limit must be positive.
    #[snafu(display("max_attempts: {value} (expected: > 0)"))]
    InvalidLimit { value: u32 },
}

/// Waits a fixed delay between attempts.
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    delay_millis: i64,
}

impl FixedBackoff {
    /// Creates a fixed backoff of `delay_millis`.
    pub fn new(delay_millis: i64) -> Result<Self, BackoffError> {
        if delay_millis < 0 {
            return NegativeDelaySnafu {
                field: "delay_millis",
                value: delay_millis,
            }
            .fail();
        }
        Ok(Self { delay_millis })
    }
}

impl Backoff for FixedBackoff {
    fn next_delay_millis(&self, _attempts_so_far: u32) -> i64 {
        self.delay_millis
    }
}

/// A backoff that never waits between attempts. Dangerous against
/// anything but an in-process collaborator.
pub fn no_delay() -> Arc<dyn Backoff> {
    Arc::new(FixedBackoff { delay_millis: 0 })
}

/// A backoff that refuses every retry.
pub fn no_retry() -> Arc<dyn Backoff> {
    Arc::new(FixedBackoff { delay_millis: -1 })
}

/// Waits an exponentially increasing delay, capped at a maximum.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    initial_delay_millis: i64,
    max_delay_millis: i64,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff.
    ///
    /// Requires `multiplier > 1` and `0 <= initial <= max`.
    pub fn new(
        initial_delay_millis: i64,
        max_delay_millis: i64,
        multiplier: f64,
    ) -> Result<Self, BackoffError> {
        if multiplier <= 1.0 {
            return InvalidMultiplierSnafu { value: multiplier }.fail();
        }
        if initial_delay_millis < 0 {
            return NegativeDelaySnafu {
                field: "initial_delay_millis",
                value: initial_delay_millis,
            }
            .fail();
        }
        if initial_delay_millis > max_delay_millis {
            return DelayOrderSnafu {
                min: initial_delay_millis,
                max: max_delay_millis,
            }
            .fail();
        }
        Ok(Self {
            initial_delay_millis,
            max_delay_millis,
            multiplier,
        })
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay_millis(&self, attempts_so_far: u32) -> i64 {
        if attempts_so_far <= 1 {
            return self.initial_delay_millis;
        }
        let factor = self.multiplier.powi(attempts_so_far as i32 - 1);
        saturated_multiply(self.initial_delay_millis, factor).min(self.max_delay_millis)
    }
}

/// Waits a uniformly random delay in `[min, max]`.
#[derive(Clone, Copy, Debug)]
pub struct RandomBackoff {
    min_delay_millis: i64,
    max_delay_millis: i64,
}

impl RandomBackoff {
    /// Creates a random backoff over `[min, max]` milliseconds.
    pub fn new(min_delay_millis: i64, max_delay_millis: i64) -> Result<Self, BackoffError> {
        if min_delay_millis < 0 {
            return NegativeDelaySnafu {
                field: "min_delay_millis",
                value: min_delay_millis,
            }
            .fail();
        }
        if min_delay_millis > max_delay_millis {
            return DelayOrderSnafu {
                min: min_delay_millis,
                max: max_delay_millis,
            }
            .fail();
        }
        Ok(Self {
            min_delay_millis,
            max_delay_millis,
        })
    }
}

impl Backoff for RandomBackoff {
    fn next_delay_millis(&self, _attempts_so_far: u32) -> i64 {
        if self.min_delay_millis == self.max_delay_millis {
            return self.min_delay_millis;
        }
        rand::thread_rng().gen_range(self.min_delay_millis..=self.max_delay_millis)
    }
}

/// Perturbs a delegate's delay by a random rate (full-jitter strategy).
///
/// The jittered delay is uniform in
/// `[base * (1 + min_rate), base * (1 + max_rate)]`, clamped at zero.
/// Non-positive delegate delays pass through unchanged so a "do not
/// retry" signal survives the wrapper.
pub struct JitterAddingBackoff {
    delegate: Arc<dyn Backoff>,
    min_jitter_rate: f64,
    max_jitter_rate: f64,
}

impl JitterAddingBackoff {
    /// Wraps `delegate`; rates must sit in `[-1, 1]` with `min <= max`.
    pub fn new(
        delegate: Arc<dyn Backoff>,
        min_jitter_rate: f64,
        max_jitter_rate: f64,
    ) -> Result<Self, BackoffError> {
        for rate in [min_jitter_rate, max_jitter_rate] {
            if !(-1.0..=1.0).contains(&rate) {
                return InvalidJitterRateSnafu { value: rate }.fail();
            }
        }
        if min_jitter_rate > max_jitter_rate {
            return JitterOrderSnafu {
                min: min_jitter_rate,
                max: max_jitter_rate,
            }
            .fail();
        }
        Ok(Self {
            delegate,
            min_jitter_rate,
            max_jitter_rate,
        })
    }
}

impl Backoff for JitterAddingBackoff {
    fn next_delay_millis(&self, attempts_so_far: u32) -> i64 {
        let base = self.delegate.next_delay_millis(attempts_so_far);
        if base <= 0 {
            return base;
        }
        let min_jitter = (base as f64 * (1.0 + self.min_jitter_rate)) as i64;
        let max_jitter = (base as f64 * (1.0 + self.max_jitter_rate)) as i64;
        let jittered = if min_jitter == max_jitter {
            min_jitter
        } else {
            rand::thread_rng().gen_range(min_jitter..=max_jitter)
        };
        jittered.max(0)
    }
}

/// Refuses retries once the attempt count reaches a limit.
pub struct AttemptLimitingBackoff {
    delegate: Arc<dyn Backoff>,
    limit: u32,
}

impl AttemptLimitingBackoff {
    /// Wraps `delegate`, allowing at most `limit` attempts.
    pub fn new(delegate: Arc<dyn Backoff>, limit: u32) -> Result<Self, BackoffError> {
        if limit == 0 {
            return InvalidLimitSnafu { value: limit }.fail();
        }
        Ok(Self { delegate, limit })
    }
}

impl Backoff for AttemptLimitingBackoff {
    fn next_delay_millis(&self, attempts_so_far: u32) -> i64 {
        if attempts_so_far >= self.limit {
            return -1;
        }
        self.delegate.next_delay_millis(attempts_so_far)
    }
}

enum Layer {
    Limit(u32),
    Jitter { min: f64, max: f64 },
}

/// Builds a backoff from a base (value or spec string) plus layered
/// wrappers, applied in the order they were added.
///
/// ```
/// use resilient_client::backoff::BackoffBuilder;
///
/// let backoff = BackoffBuilder::new()
///     .base_spec("exponential=50:5000:1.15")
///     .with_jitter(0.1)
///     .with_limit(3)
///     .build()?;
/// assert!(backoff.next_delay_millis(3) < 0);
/// # Ok::<(), resilient_client::backoff::BackoffError>(())
/// ```
#[derive(Default)]
pub struct BackoffBuilder {
    base: Option<Arc<dyn Backoff>>,
    spec: Option<String>,
    layers: Vec<Layer>,
}

impl BackoffBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base backoff directly.
    pub fn base(mut self, base: Arc<dyn Backoff>) -> Self {
        self.base = Some(base);
        self
    }

    /// Sets the base backoff from a spec string; ignored when
    /// [`base`](Self::base) was called.
    pub fn base_spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = Some(spec.into());
        self
    }

    /// Limits the number of attempts.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.layers.push(Layer::Limit(limit));
        self
    }

    /// Adds symmetric jitter of `rate` (bounds `-rate..=rate`).
    pub fn with_jitter(self, rate: f64) -> Self {
        self.with_jitter_bound(-rate, rate)
    }

    /// Adds jitter with explicit rate bounds.
    pub fn with_jitter_bound(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.layers.push(Layer::Jitter {
            min: min_rate,
            max: max_rate,
        });
        self
    }

    /// Builds the composed backoff.
    pub fn build(self) -> Result<Arc<dyn Backoff>, BackoffError> {
        let mut backoff = match (self.base, self.spec) {
            (Some(base), _) => base,
            (None, Some(spec)) => parse_spec(&spec)?,
            (None, None) => {
                return InvalidSpecSnafu {
                    spec: String::new(),
                }
                .fail()
            }
        };
        for layer in self.layers {
            backoff = match layer {
                Layer::Limit(limit) => Arc::new(AttemptLimitingBackoff::new(backoff, limit)?),
                Layer::Jitter { min, max } => {
                    Arc::new(JitterAddingBackoff::new(backoff, min, max)?)
                }
            };
        }
        Ok(backoff)
    }
}

/// Parses the backoff spec grammar.
pub fn parse_spec(spec: &str) -> Result<Arc<dyn Backoff>, BackoffError> {
    let Some((key, values)) = spec.split_once('=') else {
        return InvalidSpecSnafu { spec }.fail();
    };
    match key {
        "exponential" => {
            let parts: Vec<&str> = values.split(':').collect();
            if parts.len() != 3 {
                return InvalidSpecSnafu { spec }.fail();
            }
            let initial = parse_int(parts[0], DEFAULT_INITIAL_DELAY_MILLIS)?;
            let max = parse_int(parts[1], DEFAULT_MAX_DELAY_MILLIS)?;
            let multiplier = parse_float(parts[2], DEFAULT_MULTIPLIER)?;
            Ok(Arc::new(ExponentialBackoff::new(initial, max, multiplier)?))
        }
        "fixed" => {
            let delay = parse_int(values, DEFAULT_DELAY_MILLIS)?;
            Ok(Arc::new(FixedBackoff::new(delay)?))
        }
        "random" => {
            let parts: Vec<&str> = values.split(':').collect();
            if parts.len() != 2 {
                return InvalidSpecSnafu { spec }.fail();
            }
            let min = parse_int(parts[0], DEFAULT_MIN_DELAY_MILLIS)?;
            let max = parse_int(parts[1], DEFAULT_RANDOM_MAX_DELAY_MILLIS)?;
            Ok(Arc::new(RandomBackoff::new(min, max)?))
        }
        _ => InvalidSpecSnafu { spec }.fail(),
    }
}

fn parse_int(text: &str, default: i64) -> Result<i64, BackoffError> {
    if text.is_empty() {
        return Ok(default);
    }
    text.parse().context(InvalidIntSnafu { text })
}

fn parse_float(text: &str, default: f64) -> Result<f64, BackoffError> {
    if text.is_empty() {
        return Ok(default);
    }
    text.parse().context(InvalidFloatSnafu { text })
}

fn saturated_multiply(left: i64, right: f64) -> i64 {
    let product = left as f64 * right;
    if product < i64::MAX as f64 {
        product as i64
    } else {
        i64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_always_returns_its_delay() {
        let b = FixedBackoff::new(150).unwrap();
        for attempts in 1..10 {
            assert_eq!(b.next_delay_millis(attempts), 150);
        }
        assert!(FixedBackoff::new(-1).is_err());
    }

    #[test]
    fn no_retry_is_negative() {
        assert!(no_retry().next_delay_millis(1) < 0);
        assert_eq!(no_delay().next_delay_millis(1), 0);
    }

    #[test]
    fn exponential_is_monotone_and_capped() {
        let b = ExponentialBackoff::new(100, 4_000, 2.0).unwrap();
        let mut last = 0;
        for attempts in 1..16 {
            let delay = b.next_delay_millis(attempts);
            assert!(delay >= last);
            assert!(delay <= 4_000);
            last = delay;
        }
        assert_eq!(b.next_delay_millis(1), 100);
        assert_eq!(b.next_delay_millis(2), 200);
        assert_eq!(b.next_delay_millis(15), 4_000);
    }

    #[test]
    fn exponential_rejects_bad_parameters() {
        assert!(ExponentialBackoff::new(100, 4_000, 1.0).is_err());
        assert!(ExponentialBackoff::new(-1, 4_000, 2.0).is_err());
        assert!(ExponentialBackoff::new(5_000, 4_000, 2.0).is_err());
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let b = ExponentialBackoff::new(i64::MAX / 2, i64::MAX, 1000.0).unwrap();
        assert_eq!(b.next_delay_millis(30), i64::MAX);
    }

    #[test]
    fn random_stays_in_bounds() {
        let b = RandomBackoff::new(10, 50).unwrap();
        for _ in 0..200 {
            let delay = b.next_delay_millis(1);
            assert!((10..=50).contains(&delay));
        }
        assert_eq!(RandomBackoff::new(7, 7).unwrap().next_delay_millis(1), 7);
        assert!(RandomBackoff::new(-1, 10).is_err());
        assert!(RandomBackoff::new(10, 5).is_err());
    }

    #[test]
    fn jitter_stays_within_rate_bounds() {
        let base = 1_000;
        let rate = 0.3;
        let b = JitterAddingBackoff::new(
            Arc::new(FixedBackoff::new(base).unwrap()),
            -rate,
            rate,
        )
        .unwrap();
        for _ in 0..200 {
            let delay = b.next_delay_millis(1);
            let bound = (rate * base as f64) as i64;
            assert!((delay - base).abs() <= bound, "delay {delay} out of bounds");
        }
    }

    #[test]
    fn jitter_passes_through_non_positive_delays() {
        let b = JitterAddingBackoff::new(no_retry(), -0.5, 0.5).unwrap();
        assert_eq!(b.next_delay_millis(1), -1);
    }

    #[test]
    fn jitter_rejects_bad_rates() {
        assert!(JitterAddingBackoff::new(no_delay(), -1.5, 0.0).is_err());
        assert!(JitterAddingBackoff::new(no_delay(), 0.0, 1.5).is_err());
        assert!(JitterAddingBackoff::new(no_delay(), 0.5, -0.5).is_err());
    }

    #[test]
    fn limit_cuts_off_after_n_attempts() {
        let b = AttemptLimitingBackoff::new(no_delay(), 3).unwrap();
        assert_eq!(b.next_delay_millis(1), 0);
        assert_eq!(b.next_delay_millis(2), 0);
        assert_eq!(b.next_delay_millis(3), -1);
        assert_eq!(b.next_delay_millis(4), -1);
        assert!(AttemptLimitingBackoff::new(no_delay(), 0).is_err());
    }

    #[test]
    fn spec_parses_exponential_with_blanks() {
        let b = parse_spec("exponential=::3").unwrap();
        assert_eq!(b.next_delay_millis(1), 200);
        assert_eq!(b.next_delay_millis(2), 600);
        assert_eq!(b.next_delay_millis(3), 1_800);
        assert_eq!(b.next_delay_millis(4), 5_400);
        assert_eq!(b.next_delay_millis(5), 10_000);
    }

    #[test]
    fn spec_parses_fixed_and_random() {
        assert_eq!(parse_spec("fixed=77").unwrap().next_delay_millis(1), 77);
        assert_eq!(parse_spec("fixed=").unwrap().next_delay_millis(1), 200);

        let b = parse_spec("random=:").unwrap();
        for _ in 0..100 {
            let delay = b.next_delay_millis(1);
            assert!((0..=200).contains(&delay));
        }
        let b = parse_spec("random=10:20").unwrap();
        for _ in 0..100 {
            assert!((10..=20).contains(&b.next_delay_millis(1)));
        }
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for spec in [
            "exponential",
            "exponential=1:2",
            "exponential=1:2:3:4",
            "random=5",
            "linear=1",
            "fixed=abc",
            "",
        ] {
            assert!(parse_spec(spec).is_err(), "spec {spec:?} should fail");
        }
    }

    #[test]
    fn builder_layers_apply_in_order() {
        let backoff = BackoffBuilder::new()
            .base_spec("exponential=50:5000:2")
            .with_jitter(0.1)
            .with_limit(3)
            .build()
            .unwrap();

        for attempts in 1..3 {
            let delay = backoff.next_delay_millis(attempts);
            assert!(delay >= 0);
        }
        assert_eq!(backoff.next_delay_millis(3), -1);
    }

    #[test]
    fn builder_without_base_fails() {
        assert!(BackoffBuilder::new().build().is_err());
    }
}
