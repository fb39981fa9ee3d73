use std::collections::HashSet;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use wordtally_core::error::AppError;
use wordtally_core::models::FetchTarget;
use wordtally_core::traits::{Fetcher, Vocabulary};

use crate::extractor::normalize_word;

/// Reference vocabulary, one normalized word per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordBank {
    words: HashSet<String>,
}

impl WordBank {
    /// Parse one word per line, normalized the same way document tokens are.
    pub fn from_text(text: &str) -> Self {
        text.lines().collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_text(&String::from_utf8_lossy(bytes))
    }

    pub fn load_file(path: &Path) -> Result<Self, AppError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Download the word bank through `fetcher`, so it gets the same rate
    /// limiting and retries as the documents.
    pub async fn fetch<F: Fetcher>(
        fetcher: &F,
        source: &FetchTarget,
        cancel: &CancellationToken,
    ) -> Result<Self, AppError> {
        let bytes = fetcher.fetch(source, cancel).await?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn insert(&mut self, word: &str) -> bool {
        let word = normalize_word(word);
        !word.is_empty() && self.words.insert(word)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(String::as_str)
    }
}

impl<'a> FromIterator<&'a str> for WordBank {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut bank = WordBank::default();
        for word in iter {
            bank.insert(word);
        }
        bank
    }
}

impl Vocabulary for WordBank {
    fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    fn len(&self) -> usize {
        self.words.len()
    }
}
