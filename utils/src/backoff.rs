use std::time::Duration;

use rand::Rng;

/// Growth parameters for [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling on the computed delay, before jitter is applied.
    pub cap: Duration,
    /// Multiplier applied to the previous delay on each failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(25),
            cap: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Retry pacing for operations that contend on shared capacity.
///
/// Each call to [`next_delay`](Self::next_delay) grows the delay by the
/// policy's multiplier up to the cap, then adds up to 25% random jitter so
/// that callers that failed together do not retry together.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let raw = match self.current {
            None => self.policy.base,
            Some(previous) => previous
                .mul_f64(self.policy.multiplier)
                .min(self.policy.cap),
        };
        self.current = Some(raw);

        let jitter = rand::rng().random_range(0.0..=0.25);
        raw.mul_f64(1.0 + jitter)
    }

    /// Forgets accumulated growth, so the next delay starts from the base.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
