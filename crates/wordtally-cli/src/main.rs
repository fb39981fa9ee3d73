mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wordtally_client::{HtmlTokenExtractor, HttpFetcher, WordBank, build_fetcher};
use wordtally_core::config::{OutputFormat, Settings, load_settings, load_targets, resolve_relative};
use wordtally_core::identity::{StaticIdentitySource, spawn_refresh};
use wordtally_core::models::FetchTarget;
use wordtally_core::pipeline::{Pipeline, TracingPipelineReporter};
use wordtally_core::traits::Vocabulary;

#[derive(Parser)]
#[command(name = "wordtally", version, about = "Count word-bank words across many web pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every target and print the most frequent word-bank words
    Run {
        /// Path to the TOML configuration file
        #[arg(short, long, env = "WORDTALLY_CONFIG", default_value = "wordtally.toml")]
        config: PathBuf,

        /// File with one target URL per line (overrides sources.article-urls-file)
        #[arg(short, long)]
        urls: Option<PathBuf>,

        /// Number of words to report
        #[arg(short, long)]
        top: Option<usize>,

        /// Maximum number of documents processed at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop after this many seconds and report partial results (0 disables)
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Output format: json or csv
        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Validate the configuration and URL file without fetching anything
    Check {
        /// Path to the TOML configuration file
        #[arg(short, long, env = "WORDTALLY_CONFIG", default_value = "wordtally.toml")]
        config: PathBuf,

        /// File with one target URL per line (overrides sources.article-urls-file)
        #[arg(short, long)]
        urls: Option<PathBuf>,
    },
}

/// Command-line overrides applied on top of the config file.
#[derive(Default)]
struct Overrides {
    top: Option<usize>,
    concurrency: Option<usize>,
    deadline_secs: Option<u64>,
    format: Option<OutputFormat>,
}

impl Overrides {
    fn apply(self, settings: &mut Settings) {
        if let Some(top) = self.top {
            settings.output.top_words_count = top;
        }
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(deadline) = self.deadline_secs {
            settings.run.deadline_secs = deadline;
        }
        if let Some(format) = self.format {
            settings.output.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries only the rendered report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wordtally=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            urls,
            top,
            concurrency,
            deadline_secs,
            format,
        } => {
            let overrides = Overrides {
                top,
                concurrency,
                deadline_secs,
                format,
            };
            cmd_run(&config, urls.as_deref(), overrides).await?;
        }
        Commands::Check { config, urls } => {
            cmd_check(&config, urls.as_deref())?;
        }
    }

    Ok(())
}

/// Load settings, apply overrides, and validate the result.
fn prepare_settings(config: &Path, overrides: Overrides) -> Result<Settings> {
    let mut settings = load_settings(config)
        .with_context(|| format!("Failed to load config file: {}", config.display()))?;
    overrides.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn targets_path(config: &Path, urls: Option<&Path>, settings: &Settings) -> PathBuf {
    match urls {
        Some(path) => path.to_path_buf(),
        None => resolve_relative(config, &settings.sources.article_urls_file),
    }
}

async fn load_word_bank(
    settings: &Settings,
    config: &Path,
    fetcher: &HttpFetcher,
    cancel: &CancellationToken,
) -> Result<WordBank> {
    let source = settings.sources.word_bank.trim();
    let bank = if settings.sources.word_bank_is_remote() {
        tracing::info!(url = %source, "Downloading word bank");
        WordBank::fetch(fetcher, &FetchTarget::new(source), cancel)
            .await
            .with_context(|| format!("Failed to download word bank from {source}"))?
    } else {
        let path = resolve_relative(config, Path::new(source));
        WordBank::load_file(&path)
            .with_context(|| format!("Failed to read word bank file: {}", path.display()))?
    };

    if bank.is_empty() {
        tracing::warn!("Word bank is empty, every count will be zero");
    } else {
        tracing::info!(words = bank.len(), "Word bank loaded");
    }
    Ok(bank)
}

async fn cmd_run(config: &Path, urls: Option<&Path>, overrides: Overrides) -> Result<()> {
    let settings = prepare_settings(config, overrides)?;
    let targets = load_targets(&targets_path(config, urls, &settings))
        .context("Failed to load target URLs")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping run");
            interrupt.cancel();
        }
    });

    let identities = settings.identity_pool();
    let fetcher =
        build_fetcher(&settings, identities.clone()).context("Failed to create HTTP client")?;

    // The refresh task outlives the run's cancellation and is stopped on exit.
    let background = CancellationToken::new();
    let refresh = settings.refresh_interval().map(|every| {
        spawn_refresh(
            identities.clone(),
            StaticIdentitySource::new(settings.identities()),
            every,
            background.clone(),
        )
    });

    let bank = load_word_bank(&settings, config, &fetcher, &cancel).await?;

    tracing::info!(
        targets = targets.len(),
        concurrency = settings.concurrency,
        identities = identities.len(),
        "Starting run"
    );

    let pipeline = Pipeline::new(
        fetcher,
        HtmlTokenExtractor,
        Arc::new(bank),
        settings.pipeline_config(),
    );
    let report = pipeline
        .run(&targets, &cancel, &TracingPipelineReporter)
        .await;

    background.cancel();
    if let Some(handle) = refresh {
        let _ = handle.await;
    }

    for failure in &report.errors {
        tracing::warn!(url = %failure.target, error = %failure.error, "Target not processed");
    }
    if report.stats.cancelled {
        tracing::warn!(
            documents = report.stats.documents_processed,
            "Run was cancelled, results are partial"
        );
    }

    print!("{}", render::render(&report, &settings.output)?);
    Ok(())
}

fn cmd_check(config: &Path, urls: Option<&Path>) -> Result<()> {
    let settings = prepare_settings(config, Overrides::default())?;
    let path = targets_path(config, urls, &settings);
    let targets = load_targets(&path).context("Failed to load target URLs")?;

    let invalid: Vec<String> = targets
        .iter()
        .filter_map(|t| t.validate().err())
        .map(|e| e.to_string())
        .collect();

    println!("Configuration: {}", config.display());
    println!(
        "  rate limit:   {} req/s, burst {}",
        settings.rate_limit.requests_per_second, settings.rate_limit.burst
    );
    println!("  concurrency:  {}", settings.concurrency);
    println!(
        "  retries:      {} (backoff {}ms..{}ms)",
        settings.http.max_retries, settings.http.initial_backoff_ms, settings.http.max_backoff_ms
    );
    println!("  identities:   {}", settings.identities().len());
    println!("  word bank:    {}", settings.sources.word_bank);
    println!(
        "  output:       top {} as {}",
        settings.output.top_words_count, settings.output.format
    );
    println!("Targets: {} in {}", targets.len(), path.display());

    if !invalid.is_empty() {
        for reason in &invalid {
            println!("  invalid: {reason}");
        }
        anyhow::bail!("{} of {} targets are invalid", invalid.len(), targets.len());
    }

    println!("OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "wordtally",
            "run",
            "--config",
            "conf.toml",
            "--top",
            "5",
            "--format",
            "csv",
            "--deadline-secs",
            "30",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                config,
                top,
                format,
                deadline_secs,
                concurrency,
                ..
            } => {
                assert_eq!(config, PathBuf::from("conf.toml"));
                assert_eq!(top, Some(5));
                assert_eq!(format, Some(OutputFormat::Csv));
                assert_eq!(deadline_secs, Some(30));
                assert_eq!(concurrency, None);
            }
            Commands::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(
            Cli::try_parse_from(["wordtally", "run", "--config", "c.toml", "--format", "xml"])
                .is_err()
        );
    }

    #[test]
    fn test_overrides_are_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sources]\nword-bank = \"words.txt\"").unwrap();

        let settings = prepare_settings(
            file.path(),
            Overrides {
                top: Some(3),
                concurrency: Some(9),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.output.top_words_count, 3);
        assert_eq!(settings.concurrency, 9);

        let err = prepare_settings(
            file.path(),
            Overrides {
                concurrency: Some(0),
                ..Overrides::default()
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("concurrency"));
    }

    #[test]
    fn test_targets_path_resolves_against_config() {
        let settings = Settings::default();
        assert_eq!(
            targets_path(Path::new("/srv/wt/config.toml"), None, &settings),
            PathBuf::from("/srv/wt/urls.txt")
        );
        assert_eq!(
            targets_path(
                Path::new("/srv/wt/config.toml"),
                Some(Path::new("other.txt")),
                &settings
            ),
            PathBuf::from("other.txt")
        );
    }
}
