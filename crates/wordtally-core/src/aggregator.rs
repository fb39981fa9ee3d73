use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{RankedResult, WordCount};
use crate::traits::Vocabulary;

/// Word → occurrences. Every present key has a count of at least 1.
pub type FrequencyTable = HashMap<String, u64>;

/// Default minimum token length, in characters.
pub const DEFAULT_MIN_WORD_LENGTH: usize = 3;

/// Shape checks applied to a token before the vocabulary lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFilter {
    pub min_length: usize,
}

impl Default for TokenFilter {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_WORD_LENGTH,
        }
    }
}

impl TokenFilter {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }

    /// Long enough and made only of alphabetic characters.
    pub fn is_valid_word(&self, word: &str) -> bool {
        word.chars().count() >= self.min_length && word.chars().all(char::is_alphabetic)
    }
}

/// What the aggregator hands back once its queue is drained.
#[derive(Debug, Default)]
pub struct AggregateOutcome {
    pub table: FrequencyTable,
    pub tokens_received: u64,
    pub words_counted: u64,
}

impl AggregateOutcome {
    pub fn distinct_words(&self) -> usize {
        self.table.len()
    }
}

/// Sole owner and writer of the frequency table for one run.
pub struct Aggregator<V> {
    vocabulary: Arc<V>,
    filter: TokenFilter,
}

impl<V: Vocabulary> Aggregator<V> {
    pub fn new(vocabulary: Arc<V>, filter: TokenFilter) -> Self {
        Self { vocabulary, filter }
    }

    /// Whether `token` passes the shape checks and is in the vocabulary.
    pub fn accepts(&self, token: &str) -> bool {
        self.filter.is_valid_word(token) && self.vocabulary.contains(token)
    }

    /// Consume tokens until every sender is gone.
    ///
    /// On cancellation the queue is closed to new tokens and whatever is
    /// already buffered is still counted, so partial results survive.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> AggregateOutcome {
        let mut outcome = AggregateOutcome::default();
        let mut closing = false;

        loop {
            let token = if closing {
                rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    token = rx.recv() => token,
                    () = cancel.cancelled() => {
                        tracing::debug!("Aggregator draining after cancellation");
                        rx.close();
                        closing = true;
                        continue;
                    }
                }
            };

            let Some(token) = token else {
                break;
            };

            outcome.tokens_received += 1;
            if self.accepts(&token) {
                *outcome.table.entry(token).or_insert(0) += 1;
                outcome.words_counted += 1;
            }
        }

        tracing::debug!(
            tokens = outcome.tokens_received,
            counted = outcome.words_counted,
            distinct = outcome.table.len(),
            "Aggregator finished"
        );
        outcome
    }
}

/// Rank the table: count descending, word ascending on ties, first `top_n`.
///
/// Pure: the map's iteration order never reaches the output.
pub fn rank(table: &FrequencyTable, top_n: usize) -> RankedResult {
    let mut words: Vec<WordCount> = table
        .iter()
        .map(|(word, &count)| WordCount::new(word.clone(), count))
        .collect();

    words.sort_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    words.truncate(top_n);
    words
}
