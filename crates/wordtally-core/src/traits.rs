use std::collections::{BTreeSet, HashSet};
use std::future::Future;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, FetchFailure};
use crate::identity::ClientIdentity;
use crate::models::FetchTarget;

/// Fetches the raw bytes of a target document.
///
/// Implementations own their retry policy; a returned error is final for
/// the target. `cancel` must be observed at every suspension point.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        target: &FetchTarget,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// Raw outcome of a single HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues exactly one request with the given client identity.
pub trait Transport: Send + Sync + Clone {
    fn send(
        &self,
        url: &Url,
        identity: &ClientIdentity,
    ) -> impl Future<Output = Result<TransportResponse, FetchFailure>> + Send;
}

/// Turns document bytes into normalized word tokens, in document order.
pub trait TokenExtractor: Send + Sync + Clone {
    fn extract(&self, content: &[u8]) -> Vec<String>;
}

/// Reference vocabulary membership test.
pub trait Vocabulary: Send + Sync {
    fn contains(&self, word: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Vocabulary for HashSet<String> {
    fn contains(&self, word: &str) -> bool {
        HashSet::contains(self, word)
    }

    fn len(&self) -> usize {
        HashSet::len(self)
    }
}

impl Vocabulary for BTreeSet<String> {
    fn contains(&self, word: &str) -> bool {
        BTreeSet::contains(self, word)
    }

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }
}
