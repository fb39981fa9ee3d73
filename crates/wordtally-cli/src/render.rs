use anyhow::{Context, Result};
use serde::Serialize;
use wordtally_core::config::{OutputFormat, OutputSettings};
use wordtally_core::models::{RunReport, RunStats, TargetError, WordCount};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonOutput<'a> {
    run_id: String,
    top_words: &'a [WordCount],
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a RunStats>,
    errors: &'a [TargetError],
}

#[derive(Serialize)]
struct CsvRow<'a> {
    rank: usize,
    word: &'a str,
    count: u64,
}

/// Render the report in the configured format, ready for stdout.
///
/// Both formats end with exactly one newline.
pub fn render(report: &RunReport, output: &OutputSettings) -> Result<String> {
    match output.format {
        OutputFormat::Json => render_json(report, output.include_stats, output.pretty_print),
        OutputFormat::Csv => render_csv(report),
    }
}

fn render_json(report: &RunReport, include_stats: bool, pretty: bool) -> Result<String> {
    let out = JsonOutput {
        run_id: report.run_id.to_string(),
        top_words: &report.top_words,
        stats: include_stats.then_some(&report.stats),
        errors: &report.errors,
    };
    let json = if pretty {
        serde_json::to_string_pretty(&out)
    } else {
        serde_json::to_string(&out)
    };
    let mut text = json.context("Failed to serialize report")?;
    text.push('\n');
    Ok(text)
}

fn render_csv(report: &RunReport) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for (i, entry) in report.top_words.iter().enumerate() {
        writer
            .serialize(CsvRow {
                rank: i + 1,
                word: &entry.word,
                count: entry.count,
            })
            .context("Failed to write CSV row")?;
    }
    // An empty ranking still gets a header line.
    if report.top_words.is_empty() {
        writer
            .write_record(["rank", "word", "count"])
            .context("Failed to write CSV header")?;
    }
    let bytes = writer.into_inner().context("Failed to flush CSV output")?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}
