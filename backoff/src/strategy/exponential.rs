use std::time::Duration;

use rand::Rng;

/// An exponential strategy: the cool-off before attempt `n` is
/// `base * factor^(n - 1)`, multiplied by a random jitter factor in
/// `[1 - jitter, 1 + jitter]` and capped at `cap`.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::from_millis(100, 10_000, 2.0);
///
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
/// ```
#[derive(Clone, Debug)]
pub struct Exponential {
    /// Cool-off before the first retry.
    base: Duration,
    /// Upper bound on any single cool-off.
    cap: Duration,
    /// Growth multiplier applied per attempt.
    factor: f64,
    /// Randomization spread, `0.0` (none) to `1.0`.
    jitter: f64,
    /// Retry ceiling; `None` retries indefinitely.
    limit: Option<u32>,
    /// Attempts handed out so far.
    attempt: u32,
}

impl Exponential {
    /// Creates a strategy with no jitter and no retry ceiling.
    pub fn new(base: Duration, cap: Duration, factor: f64) -> Self {
        Self {
            base,
            cap,
            factor,
            jitter: 0.0,
            limit: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, cap_ms: u64, factor: f64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            factor,
        )
    }

    /// Sets the randomization spread. Values outside `[0, 1]` are clamped.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Bounds the number of retries the iterator will hand out.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rewinds to the initial state so the next cool-off is `base` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts handed out since creation or the last [`reset`](Self::reset).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn cool_off(&self, attempt: u32) -> Duration {
        let raw_ms = (self.base.as_millis() as f64) * self.factor.powi((attempt - 1) as i32);
        let jittered_ms = if self.jitter == 0.0 {
            raw_ms
        } else {
            raw_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };
        Duration::from_millis(jittered_ms as u64).min(self.cap)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.limit
            && self.attempt >= limit
        {
            return None;
        }
        self.attempt += 1;
        Some(self.cool_off(self.attempt))
    }
}
