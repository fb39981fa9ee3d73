pub mod aggregator;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod models;
pub mod pipeline;
pub mod rate;
pub mod retry;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use aggregator::{Aggregator, FrequencyTable, TokenFilter, rank};
pub use config::{OutputFormat, Settings, load_settings, load_targets};
pub use error::{AppError, FetchFailure};
pub use fetcher::{FetcherConfig, ResilientFetcher};
pub use identity::{ClientIdentity, IdentityPool};
pub use models::{FetchTarget, RankedResult, RunReport, RunStats, TargetError, WordCount};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReporter, TracingPipelineReporter};
pub use rate::RateBudget;
pub use retry::RetryPolicy;
pub use traits::{Fetcher, TokenExtractor, Transport, TransportResponse, Vocabulary};
