//! Consumed configuration surface of the sink. Everything is optional with
//! production defaults; hosts deserialize the whole tree from their own
//! config plumbing or build it in code.

const DEFAULT_MAX_BUFFERED_RECORDS: usize = 10_000;
const DEFAULT_MAX_BUFFERED_BYTES: usize = 5_000_000; // 5 MB
const DEFAULT_MAX_BUFFER_AGE_MS: u64 = 120_000;
const DEFAULT_BUFFER_BYTES_CEILING: usize = 20_000_000; // 20 MB
const DEFAULT_POOLING_POLICY: PoolingPolicy = PoolingPolicy::Shared;
const DEFAULT_PARTITIONS_PER_CLIENT: u32 = 1;
const DEFAULT_CLIENT_CREATE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_FLUSH_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_CAP_MS: u64 = 10_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
const DEFAULT_ERROR_TOLERANCE: ErrorTolerance = ErrorTolerance::None;
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DEAD_LETTER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;
const DEFAULT_WORKER_MAILBOX: usize = 64;

use std::fmt::Display;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use backoff::strategy::fixed;
use serde::Deserialize;

use crate::Result;
use crate::error::Error;

/// Top-level configuration of one sink task.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub buffer: BufferConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub tolerance: ErrorTolerance,
    /// Upper bound on one remote insert call.
    pub flush_timeout_ms: u64,
    /// Upper bound on one dead-letter dispatch.
    pub dead_letter_timeout_ms: u64,
    /// Budget for the final flush across all partitions during shutdown.
    pub shutdown_grace_ms: u64,
    /// Mailbox depth of each partition worker; a full mailbox backpressures
    /// `put` on the host's delivery thread.
    pub worker_mailbox: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            tolerance: DEFAULT_ERROR_TOLERANCE,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            dead_letter_timeout_ms: DEFAULT_DEAD_LETTER_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            worker_mailbox: DEFAULT_WORKER_MAILBOX,
        }
    }
}

impl SinkConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn dead_letter_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_letter_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Rejects configurations the pipeline cannot run with. Called once at
    /// task build time so workers never re-check.
    pub fn validate(&self) -> Result<()> {
        if self.buffer.max_records == 0 {
            return Err(Error::Config(
                "buffer.max_records must be at least 1".to_string(),
            ));
        }
        if self.buffer.max_bytes == 0 {
            return Err(Error::Config(
                "buffer.max_bytes must be at least 1".to_string(),
            ));
        }
        if self.buffer.bytes_ceiling < self.buffer.max_bytes {
            return Err(Error::Config(format!(
                "buffer.bytes_ceiling ({}) must not be below buffer.max_bytes ({})",
                self.buffer.bytes_ceiling, self.buffer.max_bytes
            )));
        }
        if self.buffer.max_age_ms == 0 {
            return Err(Error::Config(
                "buffer.max_age_ms must be at least 1".to_string(),
            ));
        }
        if self.pool.partitions_per_client == 0 {
            return Err(Error::Config(
                "pool.partitions_per_client must be at least 1".to_string(),
            ));
        }
        if self.retry.max_flush_attempts == 0 {
            return Err(Error::Config(
                "retry.max_flush_attempts must be at least 1".to_string(),
            ));
        }
        if let BackoffPolicy::Exponential { factor, jitter, .. } = self.retry.backoff {
            if factor < 1.0 {
                return Err(Error::Config(format!(
                    "retry.backoff.factor must be at least 1.0, got {factor}"
                )));
            }
            if !(0.0..=1.0).contains(&jitter) {
                return Err(Error::Config(format!(
                    "retry.backoff.jitter must be within [0.0, 1.0], got {jitter}"
                )));
            }
        }
        if self.worker_mailbox == 0 {
            return Err(Error::Config(
                "worker_mailbox must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-partition buffering thresholds. Crossing any of the three soft
/// thresholds makes the buffer due for a flush; `bytes_ceiling` is the hard
/// limit past which appends are rejected outright.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_age_ms: u64,
    pub bytes_ceiling: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_BUFFERED_RECORDS,
            max_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            max_age_ms: DEFAULT_MAX_BUFFER_AGE_MS,
            bytes_ceiling: DEFAULT_BUFFER_BYTES_CEILING,
        }
    }
}

impl BufferConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// How partitions map onto remote client handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingPolicy {
    /// All partitions of the task share one handle.
    Shared,
    /// Each partition group gets its own handle; group size is
    /// [`PoolConfig::partitions_per_client`].
    Isolated,
}

impl PoolingPolicy {
    /// Case-insensitive parse, falling back to the default policy for
    /// unknown values.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shared" => PoolingPolicy::Shared,
            "isolated" => PoolingPolicy::Isolated,
            _ => DEFAULT_POOLING_POLICY,
        }
    }
}

impl Display for PoolingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            PoolingPolicy::Shared => write!(f, "shared"),
            PoolingPolicy::Isolated => write!(f, "isolated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub policy: PoolingPolicy,
    /// Group size under the isolated policy; 1 means one handle per
    /// partition. Ignored under the shared policy.
    pub partitions_per_client: u32,
    pub create_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            policy: DEFAULT_POOLING_POLICY,
            partitions_per_client: DEFAULT_PARTITIONS_PER_CLIENT,
            create_timeout_ms: DEFAULT_CLIENT_CREATE_TIMEOUT_MS,
        }
    }
}

impl PoolConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }
}

/// What to do with records the store rejects as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTolerance {
    /// Any malformed record fails the task.
    None,
    /// Malformed records are dead-lettered and the pipeline continues.
    All,
}

impl ErrorTolerance {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => ErrorTolerance::None,
            "all" => ErrorTolerance::All,
            _ => DEFAULT_ERROR_TOLERANCE,
        }
    }
}

impl Display for ErrorTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ErrorTolerance::None => write!(f, "none"),
            ErrorTolerance::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per flush cycle before the partition fails, first try
    /// included.
    pub max_flush_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_flush_attempts: DEFAULT_MAX_FLUSH_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Cool-off curve between flush attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum BackoffPolicy {
    Fixed {
        #[serde(default = "default_backoff_base_ms")]
        interval_ms: u64,
    },
    Exponential {
        #[serde(default = "default_backoff_base_ms")]
        base_ms: u64,
        #[serde(default = "default_backoff_cap_ms")]
        cap_ms: u64,
        #[serde(default = "default_backoff_factor")]
        factor: f64,
        #[serde(default = "default_backoff_jitter")]
        jitter: f64,
    },
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_cap_ms() -> u64 {
    DEFAULT_BACKOFF_CAP_MS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_backoff_jitter() -> f64 {
    DEFAULT_BACKOFF_JITTER
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            cap_ms: DEFAULT_BACKOFF_CAP_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Builds the cool-off iterator for one flush cycle, bounded to at most
    /// `retries` periods.
    pub(crate) fn delays(&self, retries: u32) -> Box<dyn Iterator<Item = Duration> + Send> {
        match *self {
            BackoffPolicy::Fixed { interval_ms } => {
                Box::new(fixed::Interval::from_millis(interval_ms).take(retries as usize))
            }
            BackoffPolicy::Exponential {
                base_ms,
                cap_ms,
                factor,
                jitter,
            } => Box::new(
                Exponential::from_millis(base_ms, cap_ms, factor)
                    .with_jitter(jitter)
                    .with_limit(retries),
            ),
        }
    }
}
