//! Rate-limited, retrying fetcher with client identity rotation.
//!
//! Wraps any [`Transport`] (one request, one response) and adds everything a
//! target needs to survive throttling and flaky networks:
//!
//! 1. take one unit from the shared [`RateBudget`]
//! 2. sleep a small random pre-request jitter
//! 3. pick the next [`ClientIdentity`] from the [`IdentityPool`]
//! 4. send through the transport
//! 5. classify: 2xx returns the body, everything else is transient
//!
//! Transient failures back off exponentially (see [`RetryPolicy`]) and are
//! never surfaced; once the attempts are used up the caller gets
//! [`AppError::Terminal`] carrying the last cause.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, FetchFailure};
use crate::identity::IdentityPool;
use crate::models::FetchTarget;
use crate::rate::RateBudget;
use crate::retry::{RetryPolicy, RetryState};
use crate::traits::{Fetcher, Transport};

/// Tuning for [`ResilientFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub retry: RetryPolicy,
    /// Upper bound of the uniform delay slept before each request.
    pub pre_request_jitter: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pre_request_jitter: Duration::from_millis(500),
        }
    }
}

/// A [`Fetcher`] enforcing rate limits, retries, and identity rotation.
///
/// Cheap to clone: the rate budget and identity pool are shared handles,
/// so every clone draws from the same budget and rotation.
#[derive(Clone)]
pub struct ResilientFetcher<T> {
    transport: T,
    budget: RateBudget,
    identities: IdentityPool,
    config: FetcherConfig,
}

impl<T: Transport> ResilientFetcher<T> {
    pub fn new(
        transport: T,
        budget: RateBudget,
        identities: IdentityPool,
        config: FetcherConfig,
    ) -> Self {
        Self {
            transport,
            budget,
            identities,
            config,
        }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn identities(&self) -> &IdentityPool {
        &self.identities
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn pre_request_delay(&self) -> Duration {
        let max = self.config.pre_request_jitter;
        if max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..=max)
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        self.config.retry.delay(retry, &mut rand::thread_rng())
    }

    /// One attempt. Transient outcomes come back as [`AppError::Transient`].
    async fn attempt(&self, url: &Url, cancel: &CancellationToken) -> Result<Vec<u8>, AppError> {
        self.budget.acquire(cancel).await?;
        sleep_or_cancel(self.pre_request_delay(), cancel).await?;

        let identity = self.identities.next();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            res = self.transport.send(url, &identity) => res,
        };

        match response {
            Ok(resp) if resp.is_success() => Ok(resp.body),
            Ok(resp) => Err(AppError::Transient(FetchFailure::from_status(resp.status))),
            Err(failure) => Err(AppError::Transient(failure)),
        }
    }
}

impl<T: Transport> Fetcher for ResilientFetcher<T> {
    async fn fetch(
        &self,
        target: &FetchTarget,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AppError> {
        let url = target.validate()?;
        let mut state = RetryState::new();

        loop {
            let attempt = state.attempt();
            match self.attempt(&url, cancel).await {
                Ok(body) => {
                    tracing::debug!(
                        url = %target,
                        attempt,
                        bytes = body.len(),
                        "Fetched document"
                    );
                    return Ok(body);
                }
                Err(AppError::Transient(cause)) => {
                    let Some(retry) = state.record_failure(&self.config.retry) else {
                        tracing::warn!(
                            url = %target,
                            attempts = attempt + 1,
                            cause = %cause,
                            "Giving up on target"
                        );
                        return Err(AppError::Terminal {
                            target: target.to_string(),
                            attempts: attempt + 1,
                            cause,
                        });
                    };

                    let backoff = self.backoff_delay(retry);
                    tracing::debug!(
                        url = %target,
                        attempt,
                        cause = %cause,
                        throttled = cause.is_throttling(),
                        backoff_ms = %backoff.as_millis(),
                        "Attempt failed, backing off"
                    );
                    sleep_or_cancel(backoff, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), AppError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::identity::{ClientIdentity, build_identities};
    use crate::testutil::{MockTransport, fast_fetcher, fast_fetcher_config};

    const URL: &str = "http://example.com/article";

    fn target() -> FetchTarget {
        FetchTarget::from(URL)
    }

    #[tokio::test]
    async fn returns_body_on_first_success() {
        let transport = MockTransport::new().respond(URL, vec![MockTransport::ok("hello")]);
        let fetcher = fast_fetcher(transport.clone(), 3);

        let body = fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, b"hello");
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let transport = MockTransport::new().respond(
            URL,
            vec![MockTransport::status(429), MockTransport::ok("after retry")],
        );
        let fetcher = fast_fetcher(transport.clone(), 2);

        let body = fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, b"after retry");
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn retries_transport_failures() {
        let transport = MockTransport::new().respond(
            URL,
            vec![
                Err(FetchFailure::Timeout),
                Err(FetchFailure::Connect("refused".into())),
                MockTransport::ok("finally"),
            ],
        );
        let fetcher = fast_fetcher(transport.clone(), 3);

        let body = fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, b"finally");
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn not_found_is_retried_until_exhausted() {
        let transport = MockTransport::new().respond(URL, vec![MockTransport::status(404)]);
        let fetcher = fast_fetcher(transport.clone(), 2);

        let err = fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(transport.request_count(), 3);
        match err {
            AppError::Terminal {
                attempts, cause, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(cause, FetchFailure::Status { status: 404 });
            }
            other => panic!("expected terminal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_throttling_is_terminal_with_last_cause() {
        let transport = MockTransport::new().respond(
            URL,
            vec![MockTransport::status(500), MockTransport::status(999)],
        );
        let fetcher = fast_fetcher(transport.clone(), 1);

        let err = fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert!(matches!(
            err,
            AppError::Terminal {
                attempts: 2,
                cause: FetchFailure::Throttled { status: 999 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn invalid_target_fails_without_requests() {
        let transport = MockTransport::new();
        let fetcher = fast_fetcher(transport.clone(), 3);

        let err = fetcher
            .fetch(&FetchTarget::from("not a url"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidTarget { .. }));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn rotates_identity_on_every_attempt() {
        let transport = MockTransport::new().respond(
            URL,
            vec![
                MockTransport::status(503),
                MockTransport::status(503),
                MockTransport::ok("ok"),
            ],
        );
        let agents: Vec<String> = ["ua-a", "ua-b", "ua-c"].map(String::from).to_vec();
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            RateBudget::new(1000.0, 100).unwrap(),
            IdentityPool::new(build_identities(&agents, &[], &[])),
            fast_fetcher_config(3),
        );

        fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.user_agents(), vec!["ua-a", "ua-b", "ua-c"]);
    }

    #[tokio::test]
    async fn identity_cookies_reach_the_transport() {
        let transport = MockTransport::new().respond(URL, vec![MockTransport::ok("ok")]);
        let identity = ClientIdentity::new("ua").with_cookies(vec![
            crate::identity::IdentityCookie::new("cookie_consent", "accepted"),
        ]);
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            RateBudget::new(1000.0, 100).unwrap(),
            IdentityPool::new(vec![identity]),
            fast_fetcher_config(0),
        );

        fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        let seen = transport.identities();
        assert_eq!(
            seen[0].cookie_header("example.com").as_deref(),
            Some("cookie_consent=accepted")
        );
    }

    #[tokio::test]
    async fn every_attempt_consumes_rate_budget() {
        let transport = MockTransport::new().respond(
            URL,
            vec![
                MockTransport::status(500),
                MockTransport::status(500),
                MockTransport::ok("ok"),
            ],
        );
        // One unit up front, then 20/s: two retries need ~100ms of refill.
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            RateBudget::new(20.0, 1).unwrap(),
            IdentityPool::default(),
            fast_fetcher_config(3),
        );

        let start = Instant::now();
        fetcher
            .fetch(&target(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts_promptly() {
        let transport = MockTransport::new().respond(URL, vec![MockTransport::status(503)]);
        let mut config = fast_fetcher_config(5);
        config.retry.initial_backoff = Duration::from_secs(10);
        config.retry.max_backoff = Duration::from_secs(10);
        let fetcher = ResilientFetcher::new(
            transport.clone(),
            RateBudget::new(1000.0, 100).unwrap(),
            IdentityPool::default(),
            config,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = fetcher.fetch(&target(), &cancel).await.unwrap_err();

        assert!(matches!(err, AppError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_request() {
        let transport = MockTransport::new()
            .respond(URL, vec![MockTransport::ok("slow")])
            .with_latency(Duration::from_secs(10));
        let fetcher = fast_fetcher(transport, 0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = fetcher.fetch(&target(), &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
