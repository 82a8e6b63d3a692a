use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{Client, ClientConfig, Transport};
use crate::config::{parse_headers, RunConfig};
use crate::job::{Job, OutputColumns};
use crate::pool::{Dispatcher, RunSummary};
use crate::progress::{NoProgress, Progress};
use crate::reader::StreamingReader;
use crate::report::{self, ReportOptions};
use crate::request::Request;
use crate::stats::{Stats, StatsSnapshot};
use crate::writer::ResultWriter;

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub snapshot: StatsSnapshot,
    pub peak_in_flight: usize,
    /// Rendered report for stdout
    pub text: String,
}

/// Drives a single run from input file to report. Consumed by [`run`](Self::run).
pub struct Controller {
    config: RunConfig,
    client: Arc<Client>,
    stats: Arc<Stats>,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
}

impl Controller {
    /// Validate `config` and build the HTTP client it describes.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate().context("invalid run configuration")?;
        let stats = Arc::new(Stats::new());
        let cancel = CancellationToken::new();
        let client = Client::http(&client_config(&config), stats.transport())?
            .with_cancellation(cancel.clone());
        Ok(Self::assemble(config, client, stats, cancel))
    }

    /// Same as [`new`](Self::new) with a caller-supplied transport.
    pub fn with_transport(config: RunConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().context("invalid run configuration")?;
        let stats = Arc::new(Stats::new());
        let cancel = CancellationToken::new();
        let client = Client::new(
            transport,
            stats.transport(),
            config.max_retry,
            config.retry_delay(),
        )
        .with_cancellation(cancel.clone());
        Ok(Self::assemble(config, client, stats, cancel))
    }

    fn assemble(
        config: RunConfig,
        client: Client,
        stats: Arc<Stats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            client: Arc::new(client),
            stats,
            progress: Arc::new(NoProgress),
            cancel,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancelling this token stops launching new jobs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Read the whole input and build one job per row. Returns the input
    /// header alongside the jobs.
    pub fn build_jobs(&self) -> Result<(Vec<String>, Vec<Job>)> {
        let path = &self.config.input;
        let file = File::open(path)
            .with_context(|| format!("Failed to open input file {}", path.display()))?;
        let reader = StreamingReader::new(
            BufReader::new(file),
            self.config.method.as_str(),
            self.config.url.as_str(),
            self.config.body_column.as_str(),
        )
        .with_context(|| format!("Failed to read input file {}", path.display()))?;
        let defaults = parse_headers(&self.config.headers)?;

        let mut jobs = Vec::with_capacity(reader.count());
        while let Some(record) = reader.read()? {
            let request = Request::build(&record, reader.method(), reader.url(), &defaults);
            if let Err(e) = &request {
                warn!(job_id = jobs.len() + 1, error = %e, "failed to build request");
            }
            jobs.push(Job::new(jobs.len() + 1, record, request));
        }
        if jobs.len() != reader.count() {
            anyhow::bail!(
                "input changed while reading: scanned {} rows, read {}",
                reader.count(),
                jobs.len()
            );
        }
        Ok((reader.headers().to_vec(), jobs))
    }

    fn report_options(&self) -> ReportOptions {
        ReportOptions {
            latency: self.config.latency,
            histogram: self.config.histogram,
        }
    }

    pub async fn run(self) -> Result<RunReport> {
        let (headers, jobs) = self.build_jobs()?;
        let columns = OutputColumns {
            headers: self.config.record_headers,
            body: self.config.record_body,
        };

        let writer = match &self.config.output {
            Some(path) => {
                let writer = ResultWriter::create(path)?;
                writer.write_header(&columns.header_row(&headers))?;
                Some(Arc::new(writer))
            }
            None => None,
        };

        info!(
            url = %self.config.url,
            method = %self.config.method,
            jobs = jobs.len(),
            concurrency = self.config.concurrency,
            transport = self.client.transport_name(),
            "starting run"
        );

        self.progress.set_total(jobs.len() as u64);
        let sampler = self.stats.start_rate_sampler(self.config.rate_interval());

        let mut dispatcher = Dispatcher::new(
            self.config.concurrency,
            self.client.clone(),
            self.stats.clone(),
        )
        .with_progress(self.progress.clone())
        .with_cancellation(self.cancel.clone());
        if let Some(writer) = &writer {
            let filter = self.config.output_filter()?;
            dispatcher = dispatcher.with_writer(writer.clone(), filter, columns);
        }
        for job in jobs {
            dispatcher.submit(job);
        }
        let summary = dispatcher.run().await;

        sampler.stop().await;
        self.progress.finish();
        if let Some(writer) = &writer {
            writer.flush()?;
        }

        let snapshot = self.stats.snapshot(&self.config.percentiles);
        let peak_in_flight = dispatcher.in_flight().peak();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            peak_in_flight,
            "run finished"
        );

        let text = report::render(&snapshot, &self.report_options(), &summary);
        Ok(RunReport {
            summary,
            snapshot,
            peak_in_flight,
            text,
        })
    }
}

pub fn client_config(config: &RunConfig) -> ClientConfig {
    ClientConfig {
        timeout: config.timeout(),
        idle_timeout: config.idle_timeout(),
        insecure_skip_verify: config.insecure_skip_verify,
        max_idle_per_host: config.max_idle_per_host,
        max_retry: config.max_retry,
        retry_delay: config.retry_delay(),
    }
}
