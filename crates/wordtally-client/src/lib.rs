pub mod extractor;
pub mod transport;
pub mod word_bank;

pub use extractor::HtmlTokenExtractor;
pub use transport::ReqwestTransport;
pub use word_bank::WordBank;

use wordtally_core::config::Settings;
use wordtally_core::error::AppError;
use wordtally_core::fetcher::ResilientFetcher;
use wordtally_core::identity::IdentityPool;

/// The production fetcher: reqwest transport behind rate limiting, retries,
/// and identity rotation.
pub type HttpFetcher = ResilientFetcher<ReqwestTransport>;

/// Wire a [`HttpFetcher`] from settings, sharing `identities` so that a
/// refresh task can update the same pool.
pub fn build_fetcher(settings: &Settings, identities: IdentityPool) -> Result<HttpFetcher, AppError> {
    let transport = ReqwestTransport::new(settings.request_timeout())?;
    Ok(ResilientFetcher::new(
        transport,
        settings.rate_budget()?,
        identities,
        settings.fetcher_config(),
    ))
}
