use reqwest::StatusCode;
use std::fmt::Write;
use std::time::Duration;

use crate::pool::RunSummary;
use crate::stats::{StatsSnapshot, TRANSPORT_FAILURE};

/// Number of error causes listed at the end of the report.
const TOP_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// Print the percentile breakdown
    pub latency: bool,
    /// Print the attempt-level bucket dump
    pub histogram: bool,
}

/// Truncate to 10µs and render in the largest unit that fits.
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros() / 10 * 10;
    if micros >= 1_000_000 {
        format!("{:.2}s", micros as f64 / 1e6)
    } else if micros >= 1_000 {
        format!("{:.2}ms", micros as f64 / 1e3)
    } else {
        format!("{:.2}µs", micros as f64)
    }
}

fn status_label(code: u16) -> String {
    if code == TRANSPORT_FAILURE {
        return "Errors: 0".to_string();
    }
    let text = StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    format!("{text}: {code}")
}

fn responses(out: &mut String, snapshot: &StatsSnapshot) {
    if snapshot.codes.is_empty() {
        let _ = writeln!(out, "No responses recorded.");
        return;
    }
    let cells: Vec<(String, String)> = snapshot
        .codes
        .iter()
        .map(|(code, count)| (status_label(*code), count.to_string()))
        .collect();

    let mut labels = Vec::with_capacity(cells.len());
    let mut counts = Vec::with_capacity(cells.len());
    for (label, count) in &cells {
        let width = label.len().max(count.len());
        labels.push(format!("{label:>width$}"));
        counts.push(format!("{count:>width$}"));
    }
    let _ = writeln!(out, "{}", labels.join(" | "));
    let _ = writeln!(out, "{}", counts.join(" | "));
}

fn statistics(out: &mut String, snapshot: &StatsSnapshot, options: &ReportOptions) {
    let _ = writeln!(
        out,
        "{:<12} {:>10} {:>10} {:>10}",
        "Statistics", "Avg", "Stdev", "Max"
    );

    let rate = &snapshot.rate;
    if rate.samples == 0 {
        let _ = writeln!(out, "  Not enough data to compute request rates.");
    } else {
        let _ = writeln!(
            out,
            "  {:<10} {:>10.2} {:>10.2} {:>10.2}",
            "Reqs/sec", rate.mean, rate.stddev, rate.max
        );
    }

    let latency = &snapshot.latency;
    if latency.count == 0 {
        let _ = writeln!(out, "  Not enough data to compute latencies.");
        return;
    }
    let _ = writeln!(
        out,
        "  {:<10} {:>10} {:>10} {:>10}",
        "Latency",
        format_duration(latency.mean),
        format_duration(latency.stddev),
        format_duration(latency.max)
    );

    if options.latency && !latency.percentiles.is_empty() {
        let _ = writeln!(out, "  Latency Distribution");
        for (p, value) in &latency.percentiles {
            let pct = format_percent(*p);
            let _ = writeln!(out, "     {pct:>3}% {:>10}", format_duration(*value));
        }
    }
}

fn format_percent(p: f64) -> String {
    let pct = p * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{pct:.0}")
    } else {
        format!("{pct:.1}")
    }
}

fn histogram(out: &mut String, snapshot: &StatsSnapshot) {
    let _ = writeln!(out, "Histogram");
    if snapshot.transport.series.is_empty() {
        let _ = writeln!(out, "  no attempts recorded");
        return;
    }
    for series in &snapshot.transport.series {
        let _ = writeln!(
            out,
            "  {} ({} attempts, {} total)",
            series.method.to_uppercase(),
            series.count,
            format_duration(series.sum)
        );
        for (bound, count) in &series.buckets {
            let bound = match bound {
                Some(b) => format!("<= {}", format_duration(*b)),
                None => "+Inf".to_string(),
            };
            let _ = writeln!(out, "    {bound:>12}: {count}");
        }
        if !series.quantiles.is_empty() {
            let _ = writeln!(out, "    Quantiles");
            for (q, value) in &series.quantiles {
                let pct = format_percent(*q);
                let _ = writeln!(out, "      {pct:>4}% {:>10}", format_duration(*value));
            }
        }
    }
}

fn errors(out: &mut String, snapshot: &StatsSnapshot) {
    if snapshot.errors.is_empty() {
        return;
    }
    let _ = writeln!(out, "Errors");
    for (error, count) in snapshot.errors.iter().take(TOP_ERRORS) {
        let _ = writeln!(out, "  {count:>8} - {error}");
    }
    let rest = snapshot.errors.len().saturating_sub(TOP_ERRORS);
    if rest > 0 {
        let _ = writeln!(out, "  ... and {rest} more");
    }
}

/// Aggregate report for one run, ready for stdout.
pub fn render(snapshot: &StatsSnapshot, options: &ReportOptions, summary: &RunSummary) -> String {
    let mut out = String::new();
    responses(&mut out, snapshot);
    out.push('\n');
    statistics(&mut out, snapshot, options);
    if options.histogram {
        out.push('\n');
        histogram(&mut out, snapshot);
    }
    if !snapshot.errors.is_empty() {
        out.push('\n');
        errors(&mut out, snapshot);
    }
    out.push('\n');

    let secs = summary.elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        summary.completed as f64 / secs
    } else {
        0.0
    };
    let _ = write!(
        out,
        "{} requests in {} | {:.2} req/sec",
        summary.completed,
        format_duration(summary.elapsed),
        rate
    );
    if summary.skipped > 0 {
        let _ = write!(out, " | {} skipped (cancelled)", summary.skipped);
    }
    out.push('\n');
    out
}
