//! Bounded fan-out of fetch-and-extract tasks feeding a single aggregator.
//!
//! ```text
//!  targets ──► [semaphore: N permits] ──► fetch ─► extract ─► token queue ──► aggregator
//!                  │                                            (bounded)       (sole owner
//!                  └── JoinSet: completion barrier ──► drop last sender ──►     of the table)
//!                                                                   await aggregator ─► rank
//! ```
//!
//! Shutdown order is fixed: every fetch task finishes, the last queue sender
//! is dropped, the aggregator drains what is left, then ranking runs. A
//! run-scoped cancellation token (caller's stop signal or the deadline)
//! unblocks every suspended task; whatever was aggregated is still returned.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{AggregateOutcome, Aggregator, DEFAULT_MIN_WORD_LENGTH, TokenFilter, rank};
use crate::error::AppError;
use crate::models::{FetchTarget, RunReport, RunStats, TargetError};
use crate::traits::{Fetcher, TokenExtractor, Vocabulary};

/// Run-level knobs for [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of concurrently active fetch-and-extract tasks.
    pub concurrency: usize,
    /// Length of the ranked result.
    pub top_n: usize,
    /// Capacity of the token queue between workers and the aggregator.
    pub queue_capacity: usize,
    pub min_word_length: usize,
    /// Cancel the run after this long. `None` runs to completion.
    pub deadline: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            top_n: 10,
            queue_capacity: 1000,
            min_word_length: DEFAULT_MIN_WORD_LENGTH,
            deadline: None,
        }
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    StopRequested,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::StopRequested => write!(f, "stop requested"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started {
        run_id: Uuid,
        targets: usize,
        concurrency: usize,
    },
    TargetSucceeded {
        target: &'a str,
        bytes: usize,
        tokens: usize,
    },
    TargetFailed {
        target: &'a str,
        error: &'a AppError,
    },
    Cancelled {
        reason: CancelReason,
        not_started: usize,
    },
    Finished {
        run_id: Uuid,
        documents: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPipelineReporter;

impl PipelineReporter for TracingPipelineReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started {
                run_id,
                targets,
                concurrency,
            } => {
                tracing::info!(%run_id, %targets, %concurrency, "Run started");
            }
            PipelineEvent::TargetSucceeded {
                target,
                bytes,
                tokens,
            } => {
                tracing::info!(url = %target, %bytes, %tokens, "Document processed");
            }
            PipelineEvent::TargetFailed { target, error } => {
                tracing::warn!(url = %target, %error, "Target failed");
            }
            PipelineEvent::Cancelled {
                reason,
                not_started,
            } => {
                tracing::warn!(%reason, %not_started, "Run cancelled, returning partial results");
            }
            PipelineEvent::Finished {
                run_id,
                documents,
                failed,
                elapsed_ms,
            } => {
                tracing::info!(%run_id, %documents, %failed, %elapsed_ms, "Run finished");
            }
        }
    }
}

/// How a single target's task ended.
#[derive(Debug)]
enum TaskOutcome {
    Processed { bytes: usize, tokens: usize },
    Failed(AppError),
    Cancelled,
}

/// Orchestrates fetch → extract → aggregate → rank for a set of targets.
pub struct Pipeline<F, X, V> {
    fetcher: F,
    extractor: X,
    vocabulary: Arc<V>,
    config: PipelineConfig,
}

impl<F, X, V> Pipeline<F, X, V>
where
    F: Fetcher + 'static,
    X: TokenExtractor + 'static,
    V: Vocabulary + 'static,
{
    pub fn new(fetcher: F, extractor: X, vocabulary: Arc<V>, config: PipelineConfig) -> Self {
        Self {
            fetcher,
            extractor,
            vocabulary,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every target and return the ranked result with statistics and
    /// per-target errors.
    ///
    /// Never fails as a whole: target failures land in `errors`, and a
    /// cancelled run returns whatever was aggregated before the stop.
    pub async fn run<R: PipelineReporter>(
        &self,
        targets: &[FetchTarget],
        cancel: &CancellationToken,
        reporter: &R,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let concurrency = self.config.concurrency.clamp(1, Semaphore::MAX_PERMITS);

        reporter.report(PipelineEvent::Started {
            run_id,
            targets: targets.len(),
            concurrency,
        });

        let run_cancel = cancel.child_token();
        let deadline_timer = self.arm_deadline(&run_cancel);

        let queue_capacity = self.config.queue_capacity.clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::channel::<String>(queue_capacity);
        let aggregator = Aggregator::new(
            Arc::clone(&self.vocabulary),
            TokenFilter::new(self.config.min_word_length),
        );
        let aggregator_handle = tokio::spawn(aggregator.run(rx, run_cancel.clone()));

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight: HashMap<Id, FetchTarget> = HashMap::new();
        let mut tally = Tally::default();
        let mut launched = 0usize;

        'launch: for target in targets {
            // FIFO: a permit is taken here, before the task exists.
            let permit = loop {
                tokio::select! {
                    biased;
                    () = run_cancel.cancelled() => break 'launch,
                    Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                        tally.record(joined, &mut in_flight, reporter);
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => break 'launch,
                    },
                }
            };

            let fetcher = self.fetcher.clone();
            let extractor = self.extractor.clone();
            let tx = tx.clone();
            let task_cancel = run_cancel.clone();
            let task_target = target.clone();

            let handle = tasks.spawn(async move {
                let outcome =
                    process_target(&fetcher, &extractor, &task_target, &tx, &task_cancel).await;
                drop(permit);
                outcome
            });
            in_flight.insert(handle.id(), target.clone());
            launched += 1;
        }

        // Completion barrier: the queue closes only once every task is done.
        while let Some(joined) = tasks.join_next_with_id().await {
            tally.record(joined, &mut in_flight, reporter);
        }
        drop(tx);

        let outcome = match aggregator_handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Aggregator task failed");
                tally.errors.push(TargetError {
                    target: "aggregator".to_string(),
                    error: AppError::Aggregation(e.to_string()),
                });
                AggregateOutcome::default()
            }
        };

        let cancelled = run_cancel.is_cancelled();
        if let Some(timer) = deadline_timer {
            timer.abort();
        }
        if cancelled {
            let reason = if cancel.is_cancelled() {
                CancelReason::StopRequested
            } else {
                CancelReason::DeadlineExceeded
            };
            reporter.report(PipelineEvent::Cancelled {
                reason,
                not_started: targets.len() - launched,
            });
        }

        let top_words = rank(&outcome.table, self.config.top_n);
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        reporter.report(PipelineEvent::Finished {
            run_id,
            documents: tally.documents,
            failed: tally.errors.len(),
            elapsed_ms,
        });

        RunReport {
            run_id,
            top_words,
            stats: RunStats {
                documents_processed: tally.documents,
                targets_total: targets.len(),
                targets_failed: tally.errors.len(),
                tokens_received: outcome.tokens_received,
                words_counted: outcome.words_counted,
                distinct_words: outcome.distinct_words(),
                started_at,
                elapsed_ms,
                cancelled,
            },
            errors: tally.errors,
        }
    }

    /// Cancel `run_cancel` once the configured deadline elapses.
    fn arm_deadline(&self, run_cancel: &CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let deadline = self.config.deadline?;
        if deadline.is_zero() {
            run_cancel.cancel();
            return None;
        }

        let token = run_cancel.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(deadline) => {
                    tracing::warn!(deadline_ms = %deadline.as_millis(), "Run deadline reached");
                    token.cancel();
                }
            }
        }))
    }
}

/// Results gathered by the coordinating task as fetch tasks complete.
#[derive(Default)]
struct Tally {
    documents: usize,
    errors: Vec<TargetError>,
}

impl Tally {
    fn record<R: PipelineReporter>(
        &mut self,
        joined: Result<(Id, TaskOutcome), JoinError>,
        in_flight: &mut HashMap<Id, FetchTarget>,
        reporter: &R,
    ) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                let error = AppError::TaskFailed(e.to_string());
                (e.id(), TaskOutcome::Failed(error))
            }
        };
        let target = in_flight
            .remove(&id)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        match outcome {
            TaskOutcome::Processed { bytes, tokens } => {
                self.documents += 1;
                reporter.report(PipelineEvent::TargetSucceeded {
                    target: &target,
                    bytes,
                    tokens,
                });
            }
            TaskOutcome::Failed(error) => {
                reporter.report(PipelineEvent::TargetFailed {
                    target: &target,
                    error: &error,
                });
                self.errors.push(TargetError { target, error });
            }
            TaskOutcome::Cancelled => {
                tracing::debug!(url = %target, "Target abandoned after cancellation");
            }
        }
    }
}

/// Fetch one target, extract its tokens, and push them onto the queue.
async fn process_target<F: Fetcher, X: TokenExtractor>(
    fetcher: &F,
    extractor: &X,
    target: &FetchTarget,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let body = match fetcher.fetch(target, cancel).await {
        Ok(body) => body,
        Err(e) if e.is_cancellation() => return TaskOutcome::Cancelled,
        Err(e) => return TaskOutcome::Failed(e),
    };

    let tokens = extractor.extract(&body);
    let token_count = tokens.len();

    for token in tokens {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return TaskOutcome::Cancelled,
            sent = tx.send(token) => {
                if sent.is_err() {
                    return TaskOutcome::Cancelled;
                }
            }
        }
    }

    TaskOutcome::Processed {
        bytes: body.len(),
        tokens: token_count,
    }
}
