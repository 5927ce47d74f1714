use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::info;

use crate::model::{AggregateMetrics, MultiSummaryReport, SummaryReport};
use crate::util::{ensure_directory, write_json_pretty};

pub const SUMMARY_FILE: &str = "summary.json";
pub const SUMMARY_CSV_FILE: &str = "summary.csv";

/// Writes the run's summary files and prints the report table. A single
/// configuration gets `{summary, diagnostics}`; several get
/// `{summaries, diagnostics: {label: [...]}}` plus a CSV table.
pub fn publish(run_dir: &Path, reports: Vec<SummaryReport>) -> Result<()> {
    ensure_directory(run_dir)?;
    let summary_path = run_dir.join(SUMMARY_FILE);

    match reports.len() {
        0 => bail!("no configuration produced a report"),
        1 => {
            let report = &reports[0];
            write_json_pretty(&summary_path, report)?;
            print!("{}", render_report(&report.summary));
        }
        _ => {
            let summaries = reports
                .iter()
                .map(|report| report.summary.clone())
                .collect::<Vec<AggregateMetrics>>();
            let diagnostics = reports
                .into_iter()
                .map(|report| (report.summary.label, report.diagnostics))
                .collect::<BTreeMap<_, _>>();

            let csv_path = run_dir.join(SUMMARY_CSV_FILE);
            write_summary_csv(&csv_path, &summaries)?;
            info!(path = %csv_path.display(), "wrote comparison csv");

            print!("{}", render_comparison(&summaries));
            write_json_pretty(
                &summary_path,
                &MultiSummaryReport {
                    summaries,
                    diagnostics,
                },
            )?;
        }
    }

    info!(path = %summary_path.display(), "wrote summary");
    Ok(())
}

/// One row per configuration; columns are the sorted union of summary fields.
pub fn write_summary_csv(path: &Path, summaries: &[AggregateMetrics]) -> Result<()> {
    let rows = summaries
        .iter()
        .map(|summary| match serde_json::to_value(summary) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => bail!("summary did not serialize to an object"),
            Err(err) => Err(err).context("failed to serialize summary row"),
        })
        .collect::<Result<Vec<_>>>()?;

    let columns = rows
        .iter()
        .flat_map(|fields| fields.keys().cloned())
        .collect::<BTreeSet<String>>();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create csv file {}", path.display()))?;
    writer
        .write_record(&columns)
        .with_context(|| format!("failed to write csv header {}", path.display()))?;
    for fields in &rows {
        let record = columns
            .iter()
            .map(|column| fields.get(column).map(cell_text).unwrap_or_default())
            .collect::<Vec<String>>();
        writer
            .write_record(&record)
            .with_context(|| format!("failed to write csv row {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush csv file {}", path.display()))?;

    Ok(())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn render_report(summary: &AggregateMetrics) -> String {
    let rows = [
        ("samples scored", summary.total_samples.to_string()),
        ("bad images skipped", summary.skipped_bad_images.to_string()),
        ("extractor failures", summary.extractor_failures.to_string()),
        ("json parse rate", percent(summary.json_parse_rate)),
        ("precision", percent(summary.precision)),
        ("recall", percent(summary.recall)),
        ("f1", percent(summary.f1)),
        ("overprediction rate", percent(summary.overprediction_rate)),
        ("price reliability", percent(summary.price_reliability)),
        ("price accuracy", percent(summary.price_accuracy)),
        ("unit accuracy", percent(summary.unit_accuracy)),
        ("safe deal rate", percent(summary.safe_deal_rate)),
        ("mean iou", format!("{:.3}", summary.mean_iou)),
        ("bbox accuracy", percent(summary.bbox_accuracy)),
        ("avg gt deals", format!("{:.2}", summary.avg_gt_deals)),
        ("avg pred deals", format!("{:.2}", summary.avg_pred_deals)),
        ("empty pred rate", percent(summary.empty_pred_rate)),
        ("elapsed", format!("{:.1}s", summary.elapsed_sec)),
    ];

    let mut out = format!("== {} ({}) ==\n", summary.label, summary.run_id);
    if summary.cancelled {
        out.push_str("(cancelled: partial results)\n");
    }
    for (name, value) in rows {
        out.push_str(&format!("{name:<22}{value:>12}\n"));
    }
    out
}

pub fn render_comparison(summaries: &[AggregateMetrics]) -> String {
    let label_width = summaries
        .iter()
        .map(|summary| summary.label.chars().count())
        .max()
        .unwrap_or(0)
        .max("config".len());

    let mut out = format!(
        "{:<label_width$}  {:>7}  {:>9}  {:>6}  {:>6}  {:>6}  {:>9}  {:>9}\n",
        "config", "samples", "json_ok", "prec", "recall", "f1", "price_rel", "safe_deal"
    );
    for summary in summaries {
        out.push_str(&format!(
            "{:<label_width$}  {:>7}  {:>9}  {:>6}  {:>6}  {:>6}  {:>9}  {:>9}\n",
            summary.label,
            summary.total_samples,
            percent(summary.json_parse_rate),
            percent(summary.precision),
            percent(summary.recall),
            percent(summary.f1),
            percent(summary.price_reliability),
            percent(summary.safe_deal_rate),
        ));
    }
    out
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}
