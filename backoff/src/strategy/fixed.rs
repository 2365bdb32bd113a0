use std::time::Duration;

/// A fixed-interval strategy: every retry cools off for the same period.
///
/// The iterator never ends on its own; bound it with `take(n)` where a retry
/// ceiling is needed.
///
/// # Example
/// ```
/// use backoff::strategy::fixed::Interval;
/// use std::time::Duration;
///
/// let mut interval = Interval::from_millis(500);
/// assert_eq!(interval.next(), Some(Duration::from_millis(500)));
/// assert_eq!(interval.next(), Some(Duration::from_millis(500)));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    period: Duration,
}

impl Interval {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.period)
    }
}
