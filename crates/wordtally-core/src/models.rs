use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;

/// A remote document address, as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTarget(String);

impl FetchTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the address is an absolute http(s) URL with a host.
    pub fn validate(&self) -> Result<Url, AppError> {
        let invalid = |reason: String| AppError::InvalidTarget {
            target: self.0.clone(),
            reason,
        };

        if self.0.trim().is_empty() {
            return Err(invalid("empty address".into()));
        }
        let url = Url::parse(&self.0).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(invalid(format!("scheme '{scheme}' is not supported"))),
        }
        if url.host_str().is_none() {
            return Err(invalid("URL has no host".into()));
        }
        Ok(url)
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FetchTarget {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FetchTarget {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A counted vocabulary word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordCount {
    pub word: String,
    pub count: u64,
}

impl WordCount {
    pub fn new(word: impl Into<String>, count: u64) -> Self {
        Self {
            word: word.into(),
            count,
        }
    }
}

/// Top-N words, count descending, ties broken alphabetically.
pub type RankedResult = Vec<WordCount>;

/// Counters describing a finished (or cancelled) run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub documents_processed: usize,
    pub targets_total: usize,
    pub targets_failed: usize,
    pub tokens_received: u64,
    pub words_counted: u64,
    pub distinct_words: usize,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "timeElapsedMs")]
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

/// A terminal failure scoped to a single target.
#[derive(Debug, Serialize)]
pub struct TargetError {
    pub target: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: AppError,
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

fn serialize_display<S: Serializer>(error: &AppError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Everything a run produces, handed to the presentation layer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub top_words: RankedResult,
    pub stats: RunStats,
    pub errors: Vec<TargetError>,
}

impl RunReport {
    /// True when every target succeeded and the run was not cancelled.
    ///
    /// A run that returns `false` still carries a valid (partial) ranking.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && !self.stats.cancelled
    }
}
