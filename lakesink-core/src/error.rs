use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes of the sink. Retryable classes ([`Error::ClientCreation`],
/// [`Error::FlushTransport`]) are handled inside the flush loop with backoff;
/// every other class halts the owning partition and surfaces to the host.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Client Creation Error - {0}")]
    ClientCreation(String),

    #[error("Flush Transport Error - {0}")]
    FlushTransport(String),

    #[error("Malformed Record Error - {0}")]
    MalformedRecord(String),

    #[error("Fatal Record Error - {0}")]
    FatalRecord(String),

    #[error("Non-monotonic Offset Error - partition {partition}: stored {stored}, attempted {attempted}")]
    NonMonotonicOffset {
        partition: String,
        stored: i64,
        attempted: i64,
    },

    #[error("Buffer Capacity Error - {0}")]
    CapacityExceeded(String),

    #[error("Flush In Progress Error - {0}")]
    FlushInProgress(String),

    #[error("Retries Exhausted Error - {0}")]
    RetriesExhausted(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Task Error - {0}")]
    Task(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Whether the flush loop may retry after this error on a fresh handle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ClientCreation(_) | Error::FlushTransport(_))
    }
}
