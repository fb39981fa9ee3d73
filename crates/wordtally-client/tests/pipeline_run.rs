//! Full run: settings → fetcher → word bank → pipeline, over wiremock.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wordtally_client::{HtmlTokenExtractor, WordBank, build_fetcher};
use wordtally_core::config::parse_settings;
use wordtally_core::error::{AppError, FetchFailure};
use wordtally_core::models::{FetchTarget, WordCount};
use wordtally_core::pipeline::Pipeline;
use wordtally_core::testutil::MockReporter;

const ARTICLE_ONE: &str = r#"<html><head><title>Test results</title></head>
<body><article><p>This is a test article with some common words.</p>
<p>The test contains multiple test words that should be counted.</p>
<script>test test test test</script></article></body></html>"#;

const ARTICLE_TWO: &str = r#"<html><body><p>Another test. The word bank is common knowledge;
the bank keeps every word.</p></body></html>"#;

async fn mount(server: &MockServer, route: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

fn settings_for(server: &MockServer) -> wordtally_core::config::Settings {
    let toml = format!(
        r#"
concurrency = 2

[rate-limit]
requests-per-second = 100
burst = 20

[http]
timeout-secs = 5
max-retries = 2
initial-backoff-ms = 1
max-backoff-ms = 5
pre-request-jitter-ms = 0

[output]
top-words-count = 3

[sources]
word-bank = "{}/words.txt"
"#,
        server.uri()
    );
    let settings = parse_settings(&toml).unwrap();
    settings.validate().unwrap();
    settings
}

#[tokio::test]
async fn ranks_words_across_documents_and_reports_failures() {
    let server = MockServer::start().await;
    mount(&server, "/words.txt", 200, "test\nword\nbank\ncommon\n").await;
    mount(&server, "/one", 200, ARTICLE_ONE).await;
    mount(&server, "/two", 200, ARTICLE_TWO).await;
    mount(&server, "/gone", 503, "").await;

    let settings = settings_for(&server);
    let fetcher = build_fetcher(&settings, settings.identity_pool()).unwrap();
    let cancel = CancellationToken::new();

    let bank = WordBank::fetch(
        &fetcher,
        &FetchTarget::new(settings.sources.word_bank.clone()),
        &cancel,
    )
    .await
    .unwrap();

    let pipeline = Pipeline::new(
        fetcher,
        HtmlTokenExtractor,
        Arc::new(bank),
        settings.pipeline_config(),
    );
    let targets: Vec<FetchTarget> = ["/one", "/gone", "/two"]
        .iter()
        .map(|p| FetchTarget::new(format!("{}{p}", server.uri())))
        .collect();

    let report = pipeline.run(&targets, &cancel, &MockReporter::new()).await;

    // Title + body of /one: 4 x "test"; /two: 1 x "test". Script text is ignored.
    assert_eq!(
        report.top_words,
        vec![
            WordCount::new("test", 5),
            WordCount::new("bank", 2),
            WordCount::new("common", 2),
        ]
    );
    assert_eq!(report.stats.documents_processed, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].target.ends_with("/gone"));
    assert!(matches!(
        report.errors[0].error,
        AppError::Terminal {
            attempts: 3,
            cause: FetchFailure::Status { status: 503 },
            ..
        }
    ));
}
