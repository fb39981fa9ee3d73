use std::fmt;

use thiserror::Error;

/// Why a single fetch attempt did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The request did not complete within the per-request timeout.
    Timeout,
    /// Connection refused, reset, DNS failure, proxy unreachable.
    Connect(String),
    /// The response could not be read or was not valid HTTP.
    Malformed(String),
    /// The server asked us to slow down (429 or the non-standard 999).
    Throttled { status: u16 },
    /// Any other non-success status.
    Status { status: u16 },
}

impl FetchFailure {
    /// Status codes treated as throttling signals.
    pub const THROTTLING_STATUSES: [u16; 2] = [429, 999];

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        if Self::THROTTLING_STATUSES.contains(&status) {
            FetchFailure::Throttled { status }
        } else {
            FetchFailure::Status { status }
        }
    }

    pub fn is_throttling(&self) -> bool {
        matches!(self, FetchFailure::Throttled { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchFailure::Throttled { status } | FetchFailure::Status { status } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "request timed out"),
            FetchFailure::Connect(msg) => write!(f, "connection failed: {msg}"),
            FetchFailure::Malformed(msg) => write!(f, "malformed response: {msg}"),
            FetchFailure::Throttled { status } => write!(f, "throttled (HTTP {status})"),
            FetchFailure::Status { status } => write!(f, "unexpected status HTTP {status}"),
        }
    }
}

/// Application-wide error types for wordtally.
#[derive(Error, Debug)]
pub enum AppError {
    /// A single attempt failed in a way worth retrying.
    ///
    /// Only ever observed inside the fetcher's retry loop.
    #[error("Transient fetch failure: {0}")]
    Transient(FetchFailure),

    /// Every attempt for a target failed.
    #[error("Fetch failed for {target} after {attempts} attempt(s): {cause}")]
    Terminal {
        target: String,
        attempts: u32,
        cause: FetchFailure,
    },

    /// The target address cannot be fetched at all.
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The run was stopped by a signal or its deadline.
    #[error("Run cancelled")]
    Cancelled,

    /// Reserved for frequency-table invariant violations.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// A fetch task panicked or was aborted before reporting.
    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// HTTP client could not be built.
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }

    /// Returns true if this error ends processing of a single target.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppError::Terminal { .. } | AppError::InvalidTarget { .. }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
