//! TOML configuration: parsing, defaults, validation, and translation into
//! the runtime structs the pipeline consumes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::AppError;
use crate::fetcher::FetcherConfig;
use crate::identity::{DEFAULT_USER_AGENTS, IdentityCookie, IdentityPool, build_identities};
use crate::models::FetchTarget;
use crate::pipeline::PipelineConfig;
use crate::rate::RateBudget;
use crate::retry::RetryPolicy;

/// Slowest accepted refill rate: one request every ~11.5 days.
pub const MIN_REQUESTS_PER_SECOND: f64 = 1e-6;

/// Top-level configuration. Every section and field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Maximum number of documents fetched and tokenized at once.
    pub concurrency: usize,
    pub rate_limit: RateLimitSettings,
    pub http: HttpSettings,
    pub identity: IdentitySettings,
    pub words: WordSettings,
    pub output: OutputSettings,
    pub sources: SourceSettings,
    pub run: RunSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit: RateLimitSettings::default(),
            http: HttpSettings::default(),
            identity: IdentitySettings::default(),
            words: WordSettings::default(),
            output: OutputSettings::default(),
            sources: SourceSettings::default(),
            run: RunSettings::default(),
        }
    }
}

/// Shared outbound request budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpSettings {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of the random delay before each request. 0 disables.
    pub pre_request_jitter_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            pre_request_jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdentitySettings {
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub cookies: Vec<IdentityCookie>,
    /// How often the identity pool is reloaded. 0 disables refreshing.
    pub refresh_interval_secs: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            proxies: Vec::new(),
            cookies: vec![IdentityCookie::new("cookie_consent", "accepted")],
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WordSettings {
    pub min_word_length: usize,
}

impl Default for WordSettings {
    fn default() -> Self {
        Self { min_word_length: 3 }
    }
}

/// Rendering format of the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format '{other}' (expected json or csv)")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OutputSettings {
    pub top_words_count: usize,
    pub include_stats: bool,
    pub format: OutputFormat,
    pub pretty_print: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            top_words_count: 10,
            include_stats: true,
            format: OutputFormat::Json,
            pretty_print: true,
        }
    }
}

/// Where targets and the vocabulary come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SourceSettings {
    /// One target URL per line. Relative paths resolve against the config file.
    pub article_urls_file: PathBuf,
    /// URL or local path of the word bank, one word per line.
    pub word_bank: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            article_urls_file: PathBuf::from("urls.txt"),
            word_bank: String::new(),
        }
    }
}

impl SourceSettings {
    /// Whether the word bank is fetched over HTTP rather than read from disk.
    pub fn word_bank_is_remote(&self) -> bool {
        let bank = self.word_bank.trim();
        bank.starts_with("http://") || bank.starts_with("https://")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunSettings {
    /// Cancel the run after this many seconds. 0 disables the deadline.
    pub deadline_secs: u64,
    pub queue_capacity: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            deadline_secs: 0,
            queue_capacity: 1000,
        }
    }
}

/// Read, parse, and validate a TOML settings file.
pub fn load_settings(path: &Path) -> Result<Settings, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("cannot read config file {}: {e}", path.display()))
    })?;
    let settings = parse_settings(&content)?;
    settings.validate()?;
    Ok(settings)
}

/// Parse settings from TOML text without validating them.
pub fn parse_settings(content: &str) -> Result<Settings, AppError> {
    toml::from_str(content).map_err(|e| AppError::ConfigError(format!("invalid TOML: {e}")))
}

/// Read target addresses, one per line. Blank lines and `#` comments are
/// skipped; a file with no targets is an error.
pub fn load_targets(path: &Path) -> Result<Vec<FetchTarget>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("cannot read URL file {}: {e}", path.display()))
    })?;

    let targets: Vec<FetchTarget> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(FetchTarget::from)
        .collect();

    if targets.is_empty() {
        return Err(AppError::ConfigError(format!(
            "no URLs found in {}",
            path.display()
        )));
    }
    Ok(targets)
}

/// Resolve `relative` against the directory holding `config_path`.
pub fn resolve_relative(config_path: &Path, relative: &Path) -> PathBuf {
    if relative.is_absolute() {
        return relative.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(relative),
        _ => relative.to_path_buf(),
    }
}

impl Settings {
    /// Check value ranges. Returns the first problem found.
    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: &str| Err(AppError::ConfigError(msg.to_string()));

        if !(self.rate_limit.requests_per_second.is_finite()
            && self.rate_limit.requests_per_second > 0.0)
        {
            return fail("rate-limit.requests-per-second must be positive");
        }
        if self.rate_limit.requests_per_second < MIN_REQUESTS_PER_SECOND {
            return Err(AppError::ConfigError(format!(
                "rate-limit.requests-per-second must be at least {MIN_REQUESTS_PER_SECOND}"
            )));
        }
        if self.rate_limit.burst == 0 {
            return fail("rate-limit.burst must be at least 1");
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1");
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return Err(AppError::ConfigError(format!(
                "concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.http.timeout_secs == 0 {
            return fail("http.timeout-secs must be positive");
        }
        if self.http.max_backoff_ms < self.http.initial_backoff_ms {
            return fail("http.max-backoff-ms must not be below http.initial-backoff-ms");
        }
        if self.identity.user_agents.iter().all(|ua| ua.trim().is_empty()) {
            return fail("identity.user-agents must contain at least one user agent");
        }
        for proxy in &self.identity.proxies {
            Url::parse(proxy).map_err(|e| {
                AppError::ConfigError(format!("identity.proxies: invalid proxy '{proxy}': {e}"))
            })?;
        }
        if self.words.min_word_length == 0 {
            return fail("words.min-word-length must be at least 1");
        }
        if self.output.top_words_count == 0 {
            return fail("output.top-words-count must be at least 1");
        }
        if self.run.queue_capacity == 0 {
            return fail("run.queue-capacity must be at least 1");
        }
        if self.run.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(AppError::ConfigError(format!(
                "run.queue-capacity must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.sources.word_bank.trim().is_empty() {
            return fail("sources.word-bank is required");
        }
        Ok(())
    }

    pub fn rate_budget(&self) -> Result<RateBudget, AppError> {
        RateBudget::new(self.rate_limit.requests_per_second, self.rate_limit.burst)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.http.max_retries,
            Duration::from_millis(self.http.initial_backoff_ms),
            Duration::from_millis(self.http.max_backoff_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            retry: self.retry_policy(),
            pre_request_jitter: Duration::from_millis(self.http.pre_request_jitter_ms),
        }
    }

    /// Identities built from the configured user agents, proxies, and cookies.
    pub fn identities(&self) -> Vec<crate::identity::ClientIdentity> {
        let user_agents: Vec<String> = self
            .identity
            .user_agents
            .iter()
            .filter(|ua| !ua.trim().is_empty())
            .cloned()
            .collect();
        build_identities(&user_agents, &self.identity.proxies, &self.identity.cookies)
    }

    pub fn identity_pool(&self) -> IdentityPool {
        IdentityPool::new(self.identities())
    }

    /// `None` when identity refreshing is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.identity.refresh_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            concurrency: self.concurrency,
            top_n: self.output.top_words_count,
            queue_capacity: self.run.queue_capacity,
            min_word_length: self.words.min_word_length,
            deadline: match self.run.deadline_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const FULL: &str = r#"
concurrency = 8

[rate-limit]
requests-per-second = 2.5
burst = 4

[http]
timeout-secs = 10
max-retries = 5
initial-backoff-ms = 200
max-backoff-ms = 4000
pre-request-jitter-ms = 0

[identity]
user-agents = ["agent-a", "agent-b"]
proxies = ["http://proxy-1:8080", "socks5://proxy-2:1080", "http://proxy-3:8080"]
refresh-interval-secs = 0

[[identity.cookies]]
name = "A1"
value = "xyz"
domain = "example.com"

[words]
min-word-length = 4

[output]
top-words-count = 25
include-stats = false
format = "csv"
pretty-print = false

[sources]
article-urls-file = "targets.txt"
word-bank = "https://example.com/words.txt"

[run]
deadline-secs = 90
queue-capacity = 64
"#;

    #[test]
    fn test_full_config_parses() {
        let file = write_temp(FULL);
        let settings = load_settings(file.path()).unwrap();

        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.rate_limit.burst, 4);
        assert_eq!(settings.http.max_retries, 5);
        assert_eq!(settings.output.format, OutputFormat::Csv);
        assert!(!settings.output.include_stats);
        assert!(settings.sources.word_bank_is_remote());
        assert_eq!(settings.refresh_interval(), None);

        let pipeline = settings.pipeline_config();
        assert_eq!(pipeline.concurrency, 8);
        assert_eq!(pipeline.top_n, 25);
        assert_eq!(pipeline.queue_capacity, 64);
        assert_eq!(pipeline.min_word_length, 4);
        assert_eq!(pipeline.deadline, Some(Duration::from_secs(90)));

        let retry = settings.retry_policy();
        assert_eq!(retry.max_attempts(), 6);
        assert_eq!(retry.initial_backoff, Duration::from_millis(200));
        assert_eq!(settings.fetcher_config().pre_request_jitter, Duration::ZERO);
    }

    #[test]
    fn test_identities_zip_agents_and_proxies() {
        let settings = parse_settings(FULL).unwrap();
        let identities = settings.identities();

        assert_eq!(identities.len(), 3);
        assert_eq!(identities[2].user_agent, "agent-a");
        assert_eq!(identities[2].proxy.as_deref(), Some("http://proxy-3:8080"));
        assert_eq!(
            identities[0].cookie_header("www.example.com").as_deref(),
            Some("A1=xyz")
        );
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let settings = parse_settings("[sources]\nword-bank = \"words.txt\"\n").unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.rate_limit.requests_per_second, 5.0);
        assert_eq!(settings.rate_limit.burst, 10);
        assert_eq!(settings.http.timeout_secs, 30);
        assert_eq!(settings.words.min_word_length, 3);
        assert_eq!(settings.output.top_words_count, 10);
        assert_eq!(settings.output.format, OutputFormat::Json);
        assert_eq!(settings.identity.user_agents.len(), DEFAULT_USER_AGENTS.len());
        assert_eq!(settings.pipeline_config().deadline, None);
        assert!(!settings.sources.word_bank_is_remote());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            ("concurrency = 0", "concurrency"),
            ("[rate-limit]\nrequests-per-second = 0", "requests-per-second"),
            ("[rate-limit]\nrequests-per-second = 1e-20", "requests-per-second"),
            ("concurrency = 9223372036854775807", "concurrency"),
            ("[rate-limit]\nburst = 0", "burst"),
            (
                "[http]\ninitial-backoff-ms = 5000\nmax-backoff-ms = 100",
                "max-backoff-ms",
            ),
            ("[identity]\nuser-agents = []", "user-agents"),
            ("[identity]\nproxies = [\"not a proxy\"]", "proxies"),
            ("[output]\ntop-words-count = 0", "top-words-count"),
            ("[run]\nqueue-capacity = 0", "queue-capacity"),
            ("[run]\nqueue-capacity = 9223372036854775807", "queue-capacity"),
        ];

        for (toml, needle) in cases {
            let content = format!("{toml}\n[sources]\nword-bank = \"words.txt\"\n");
            let content = if toml.starts_with('[') {
                format!("[sources]\nword-bank = \"words.txt\"\n{toml}\n")
            } else {
                content
            };
            let err = parse_settings(&content).unwrap().validate().unwrap_err();
            assert!(err.to_string().contains(needle), "{needle}: {err}");
        }
    }

    #[test]
    fn test_validation_accepts_range_limits() {
        let mut settings = Settings::default();
        settings.sources.word_bank = "words.txt".into();
        settings.rate_limit.requests_per_second = MIN_REQUESTS_PER_SECOND;
        settings.concurrency = Semaphore::MAX_PERMITS;
        settings.run.queue_capacity = Semaphore::MAX_PERMITS;
        settings.validate().unwrap();
        settings.rate_budget().unwrap();
    }

    #[test]
    fn test_missing_word_bank_is_rejected() {
        let err = Settings::default().validate().unwrap_err();
        assert!(err.to_string().contains("word-bank"));
    }

    #[test]
    fn test_unknown_format_is_a_parse_error() {
        let err = parse_settings("[output]\nformat = \"yaml\"").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_load_targets_skips_blanks_and_comments() {
        let file = write_temp(
            "# news sources\nhttps://example.com/a\n\n   \n  https://example.com/b  \n# https://skip.me\n",
        );
        let targets = load_targets(file.path()).unwrap();
        assert_eq!(
            targets,
            vec![
                FetchTarget::from("https://example.com/a"),
                FetchTarget::from("https://example.com/b"),
            ]
        );
    }

    #[test]
    fn test_load_targets_rejects_empty_file() {
        let file = write_temp("# nothing here\n\n");
        let err = load_targets(file.path()).unwrap_err();
        assert!(err.to_string().contains("no URLs found"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_settings(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_resolve_relative() {
        let config = Path::new("/etc/wordtally/config.toml");
        assert_eq!(
            resolve_relative(config, Path::new("urls.txt")),
            PathBuf::from("/etc/wordtally/urls.txt")
        );
        assert_eq!(
            resolve_relative(config, Path::new("/tmp/urls.txt")),
            PathBuf::from("/tmp/urls.txt")
        );
        assert_eq!(
            resolve_relative(Path::new("config.toml"), Path::new("urls.txt")),
            PathBuf::from("urls.txt")
        );
    }
}
