//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, FetchFailure};
use crate::fetcher::{FetcherConfig, ResilientFetcher};
use crate::identity::{ClientIdentity, IdentityPool};
use crate::models::FetchTarget;
use crate::pipeline::{PipelineEvent, PipelineReporter};
use crate::rate::RateBudget;
use crate::retry::RetryPolicy;
use crate::traits::{Fetcher, TokenExtractor, Transport, TransportResponse};

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    scripts: HashMap<String, Vec<Result<TransportResponse, FetchFailure>>>,
    requests: Vec<(String, ClientIdentity)>,
}

/// Scripted transport. Each URL replays its responses in order; the last
/// one repeats forever. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url: &str, responses: Vec<Result<TransportResponse, FetchFailure>>) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(normalize(url), responses);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn ok(body: &str) -> Result<TransportResponse, FetchFailure> {
        Ok(TransportResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        })
    }

    pub fn status(status: u16) -> Result<TransportResponse, FetchFailure> {
        Ok(TransportResponse {
            status,
            body: Vec::new(),
        })
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn request_count_for(&self, url: &str) -> usize {
        let url = normalize(url);
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(u, _)| *u == url)
            .count()
    }

    /// User agents presented, in request order.
    pub fn user_agents(&self) -> Vec<String> {
        self.identities()
            .into_iter()
            .map(|identity| identity.user_agent)
            .collect()
    }

    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|(_, identity)| identity.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    async fn send(
        &self,
        url: &Url,
        identity: &ClientIdentity,
    ) -> Result<TransportResponse, FetchFailure> {
        let response = {
            let mut state = self.state.lock().unwrap();
            state
                .requests
                .push((url.to_string(), identity.clone()));
            match state.scripts.get_mut(url.as_str()) {
                Some(script) if script.len() > 1 => script.remove(0),
                Some(script) => script.first().cloned().unwrap_or(Ok(TransportResponse {
                    status: 404,
                    body: Vec::new(),
                })),
                None => Ok(TransportResponse {
                    status: 404,
                    body: Vec::new(),
                }),
            }
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        response
    }
}

/// A [`ResilientFetcher`] with a generous budget and millisecond backoff.
pub fn fast_fetcher(transport: MockTransport, max_retries: u32) -> ResilientFetcher<MockTransport> {
    ResilientFetcher::new(
        transport,
        RateBudget::new(1000.0, 100).unwrap(),
        IdentityPool::default(),
        fast_fetcher_config(max_retries),
    )
}

pub fn fast_fetcher_config(max_retries: u32) -> FetcherConfig {
    FetcherConfig {
        retry: RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ),
        pre_request_jitter: Duration::ZERO,
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FetcherState {
    documents: HashMap<String, (Vec<u8>, Option<Duration>)>,
    errors: HashMap<String, AppError>,
    calls: Vec<String>,
}

/// Fetcher returning canned documents per target, with optional latency.
///
/// Errors are returned once; a second fetch of the same target then sees
/// a 404 terminal error.
#[derive(Clone, Default)]
pub struct MockFetcher {
    state: Arc<Mutex<FetcherState>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, target: &str, body: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .documents
            .insert(target.to_string(), (body.as_bytes().to_vec(), None));
        self
    }

    /// A document that takes `latency` to arrive, overriding the default.
    pub fn with_slow_document(self, target: &str, body: &str, latency: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .documents
            .insert(target.to_string(), (body.as_bytes().to_vec(), Some(latency)));
        self
    }

    pub fn with_error(self, target: &str, error: AppError) -> Self {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert(target.to_string(), error);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Highest number of fetches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        target: &FetchTarget,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AppError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));

        let (outcome, latency) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(target.to_string());
            if let Some(error) = state.errors.remove(target.as_str()) {
                (Err(error), self.latency)
            } else if let Some((body, latency)) = state.documents.get(target.as_str()) {
                (Ok(body.clone()), latency.unwrap_or(self.latency))
            } else {
                let error = AppError::Terminal {
                    target: target.to_string(),
                    attempts: 1,
                    cause: FetchFailure::Status { status: 404 },
                };
                (Err(error), self.latency)
            }
        };

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if !latency.is_zero() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// WhitespaceExtractor
// ---------------------------------------------------------------------------

/// Splits plain text on whitespace, lowercases, and strips non-letters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceExtractor;

impl TokenExtractor for WhitespaceExtractor {
    fn extract(&self, content: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(content)
            .split_whitespace()
            .map(|raw| {
                raw.chars()
                    .filter(|c| c.is_alphabetic())
                    .flat_map(char::to_lowercase)
                    .collect::<String>()
            })
            .filter(|token| !token.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records the kind of every pipeline event it receives.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match event {
            PipelineEvent::Started { .. } => "Started",
            PipelineEvent::TargetSucceeded { .. } => "TargetSucceeded",
            PipelineEvent::TargetFailed { .. } => "TargetFailed",
            PipelineEvent::Cancelled { .. } => "Cancelled",
            PipelineEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
