use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use postit_core::{BarProgress, Controller, Progress, RunConfig, RunReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "post-it")]
#[command(about = "Send one HTTP request per CSV row and report on the responses")]
struct Args {
    #[command(subcommand)]
    method: Method,
}

#[derive(Subcommand, Debug)]
enum Method {
    /// Send GET requests
    #[command(name = "GET", alias = "get")]
    Get(RunArgs),
    /// Send HEAD requests
    #[command(name = "HEAD", alias = "head")]
    Head(RunArgs),
    /// Send POST requests with the body column as payload
    #[command(name = "POST", alias = "post")]
    Post(RunArgs),
    /// Send PUT requests with the body column as payload
    #[command(name = "PUT", alias = "put")]
    Put(RunArgs),
    /// Send PATCH requests with the body column as payload
    #[command(name = "PATCH", alias = "patch")]
    Patch(RunArgs),
    /// Send DELETE requests
    #[command(name = "DELETE", alias = "delete")]
    Delete(RunArgs),
}

impl Method {
    fn split(self) -> (&'static str, RunArgs) {
        match self {
            Method::Get(a) => ("GET", a),
            Method::Head(a) => ("HEAD", a),
            Method::Post(a) => ("POST", a),
            Method::Put(a) => ("PUT", a),
            Method::Patch(a) => ("PATCH", a),
            Method::Delete(a) => ("DELETE", a),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// URL template; `{column}` is replaced with the row's value
    url: String,

    /// TOML file with run settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input CSV file
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of requests in flight at once
    #[arg(short = 'c', long = "connections")]
    connections: Option<usize>,

    /// Per-request timeout in milliseconds (0 disables)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Idle connection timeout in milliseconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Skip TLS certificate verification
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    insecure_skip_verify: Option<bool>,

    /// Extra header, "Key: v1,v2" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Column sent as the request body
    #[arg(long)]
    body_column: Option<String>,

    /// Which results to write: all, errors or status
    #[arg(long)]
    response_type: Option<String>,

    /// Status selector for --response-type status: any, 4xx, -2xx, 404
    #[arg(long)]
    status: Option<String>,

    /// Add a column with the response headers
    #[arg(long)]
    record_headers: bool,

    /// Add a column with the response body
    #[arg(long)]
    record_body: bool,

    /// Always write rows for requests that got no response
    #[arg(long)]
    record_errors: bool,

    /// Retries for 5xx responses
    #[arg(long)]
    max_retry: Option<u32>,

    /// Delay between retries in milliseconds
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Print the latency percentile distribution
    #[arg(long)]
    latency: bool,

    /// Print the per-attempt duration histogram
    #[arg(long)]
    histogram: bool,

    /// Write a JSON run summary to this path
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl RunArgs {
    fn into_config(self, method: &str) -> Result<(RunConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => RunConfig::default(),
        };

        config.url = self.url;
        config.method = method.to_string();
        if let Some(v) = self.input {
            config.input = v;
        }
        if self.output.is_some() {
            config.output = self.output;
        }
        if let Some(v) = self.connections {
            config.concurrency = v;
        }
        if let Some(v) = self.timeout {
            config.timeout_ms = v;
        }
        if let Some(v) = self.idle_timeout {
            config.idle_timeout_ms = v;
        }
        if let Some(v) = self.insecure_skip_verify {
            config.insecure_skip_verify = v;
        }
        config.headers.extend(self.headers);
        if let Some(v) = self.body_column {
            config.body_column = v;
        }
        if let Some(v) = self.response_type {
            config.response_type = v;
        }
        if let Some(v) = self.status {
            config.status = v;
        }
        config.record_headers |= self.record_headers;
        config.record_body |= self.record_body;
        config.record_errors |= self.record_errors;
        if let Some(v) = self.max_retry {
            config.max_retry = v;
        }
        if let Some(v) = self.retry_delay {
            config.retry_delay_ms = v;
        }
        config.latency |= self.latency;
        config.histogram |= self.histogram;
        if self.summary.is_some() {
            config.summary = self.summary;
        }

        Ok((config, !self.no_progress))
    }
}

#[derive(Debug, Serialize)]
struct LatencySummary {
    mean_us: u64,
    stddev_us: u64,
    max_us: u64,
    percentiles_us: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
struct ThroughputSummary {
    overall: f64,
    sampled_mean: f64,
    sampled_stddev: f64,
    sampled_max: f64,
}

#[derive(Debug, Serialize)]
struct RunSummaryFile {
    timestamp: String,
    url: String,
    method: String,
    submitted: usize,
    completed: usize,
    skipped: usize,
    cancelled: bool,
    elapsed_ms: u64,
    peak_in_flight: usize,
    attempts: u64,
    /// Per-method attempt durations, quantile label to microseconds
    attempt_quantiles_us: BTreeMap<String, BTreeMap<String, u64>>,
    codes: BTreeMap<String, u64>,
    errors: BTreeMap<String, u64>,
    latency: LatencySummary,
    throughput: ThroughputSummary,
}

fn micros(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn quantile_key(q: f64) -> String {
    format!("p{}", (q * 1000.0).round() / 10.0)
}

fn quantile_map(values: &[(f64, std::time::Duration)]) -> BTreeMap<String, u64> {
    values
        .iter()
        .map(|(q, d)| (quantile_key(*q), micros(*d)))
        .collect()
}

fn write_summary(path: &Path, config: &RunConfig, report: &RunReport) -> Result<()> {
    let snap = &report.snapshot;
    let secs = report.summary.elapsed.as_secs_f64();
    let summary = RunSummaryFile {
        timestamp: chrono::Utc::now().to_rfc3339(),
        url: config.url.clone(),
        method: config.method.clone(),
        submitted: report.summary.submitted,
        completed: report.summary.completed,
        skipped: report.summary.skipped,
        cancelled: report.summary.cancelled,
        elapsed_ms: report.summary.elapsed.as_millis() as u64,
        peak_in_flight: report.peak_in_flight,
        attempts: snap.transport.attempts(),
        attempt_quantiles_us: snap
            .transport
            .series
            .iter()
            .map(|s| (s.method.to_uppercase(), quantile_map(&s.quantiles)))
            .collect(),
        codes: snap.codes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        errors: snap.errors.iter().cloned().collect(),
        latency: LatencySummary {
            mean_us: micros(snap.latency.mean),
            stddev_us: micros(snap.latency.stddev),
            max_us: micros(snap.latency.max),
            percentiles_us: quantile_map(&snap.latency.percentiles),
        },
        throughput: ThroughputSummary {
            overall: if secs > 0.0 {
                report.summary.completed as f64 / secs
            } else {
                0.0
            },
            sampled_mean: snap.rate.mean,
            sampled_stddev: snap.rate.stddev,
            sampled_max: snap.rate.max,
        },
    };

    let json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    info!("Summary written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let (method, run_args) = args.method.split();
    let (config, show_progress) = run_args.into_config(method)?;

    let mut controller = Controller::new(config.clone())?;
    if show_progress {
        let bar: Arc<dyn Progress> = Arc::new(BarProgress::new());
        controller = controller.with_progress(bar);
    }

    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight requests");
            cancel.cancel();
        }
    });

    let report = controller.run().await?;
    print!("{}", report.text);

    if let Some(path) = &config.summary {
        write_summary(path, &config, &report)?;
    }

    Ok(())
}
