use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{OutputFilter, OutputPolicy};
use crate::request::parse_method;

/// Everything one run needs. Loaded from TOML and/or filled in by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// URL template, e.g. `http://localhost:3000/post/{id}`
    pub url: String,
    pub method: String,
    pub input: PathBuf,
    /// No output path means no rows are written
    pub output: Option<PathBuf>,
    /// Column whose value is sent as the request body
    pub body_column: String,

    /// Maximum number of jobs executing at once
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub insecure_skip_verify: bool,
    pub max_idle_per_host: usize,
    /// Default headers, `"Key: v1,v2"`
    pub headers: Vec<String>,

    /// One of `all`, `errors`, `status`
    pub response_type: String,
    /// Status selector used when `response_type = "status"`
    pub status: String,
    pub record_headers: bool,
    pub record_body: bool,
    pub record_errors: bool,

    pub max_retry: u32,
    pub retry_delay_ms: u64,

    /// Print the latency percentile distribution
    pub latency: bool,
    /// Print the raw attempt histogram
    pub histogram: bool,
    pub percentiles: Vec<f64>,
    pub rate_interval_ms: u64,

    /// Optional JSON summary written after the run
    pub summary: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            input: PathBuf::from("input.csv"),
            output: None,
            body_column: "request_body".to_string(),
            concurrency: 10,
            timeout_ms: 3000,
            idle_timeout_ms: 5000,
            insecure_skip_verify: true,
            max_idle_per_host: 10,
            headers: Vec::new(),
            response_type: "status".to_string(),
            status: "-2xx".to_string(),
            record_headers: false,
            record_body: false,
            record_errors: false,
            max_retry: 0,
            retry_delay_ms: 100,
            latency: false,
            histogram: false,
            percentiles: vec![0.5, 0.75, 0.9, 0.95, 0.99],
            rate_interval_ms: 10,
            summary: None,
        }
    }
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject anything that would otherwise fail once jobs are running.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            anyhow::bail!("url template is required");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        parse_method(&self.method).with_context(|| format!("invalid method {}", self.method))?;
        self.output_filter()?;
        parse_headers(&self.headers)?;
        Ok(())
    }

    pub fn output_filter(&self) -> Result<OutputFilter> {
        let policy = OutputPolicy::parse(&self.response_type, &self.status)?;
        Ok(OutputFilter::new(policy, self.record_errors))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rate_interval(&self) -> Duration {
        Duration::from_millis(self.rate_interval_ms.max(1))
    }
}

/// Parse `"Key: v1, v2"` strings into a header multi-map. Repeated keys
/// accumulate values.
pub fn parse_headers(headers: &[String]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for raw in headers {
        let (key, values) = raw
            .split_once(':')
            .with_context(|| format!("header must look like \"Key: value\" (got {raw:?})"))?;
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .with_context(|| format!("invalid header name in {raw:?}"))?;
        for value in values.split(',') {
            let value = HeaderValue::from_str(value.trim())
                .with_context(|| format!("invalid header value in {raw:?}"))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}
