use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::metrics::TransportMetrics;
use crate::request::Request;

/// What came back from the target.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Duration of the attempt that produced this response
    pub duration: Duration,
    /// Total attempts made, retries included
    pub attempts: u32,
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send + 'a>>;

/// One HTTP attempt, no retries.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub idle_timeout: Duration,
    pub insecure_skip_verify: bool,
    pub max_idle_per_host: usize,
    pub max_retry: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            idle_timeout: Duration::from_millis(5000),
            insecure_skip_verify: false,
            max_idle_per_host: 10,
            max_retry: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .danger_accept_invalid_certs(config.insecure_skip_verify);
        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?.to_vec();

            Ok(Response {
                status,
                headers,
                body,
                duration: start.elapsed(),
                attempts: 1,
            })
        })
    }
}

pub fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Transport plus retry policy and attempt metrics.
pub struct Client {
    transport: Arc<dyn Transport>,
    metrics: Arc<TransportMetrics>,
    max_retry: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<TransportMetrics>,
        max_retry: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            metrics,
            max_retry,
            retry_delay,
            cancel: CancellationToken::new(),
        }
    }

    /// Build an [`HttpTransport`] from `config`.
    pub fn http(config: &ClientConfig, metrics: Arc<TransportMetrics>) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(
            Arc::new(transport),
            metrics,
            config.max_retry,
            config.retry_delay,
        ))
    }

    /// A cancelled token cuts any pending retry delay short.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Send `request`. Transport failures return at once. A 5xx response is
    /// retried after `retry_delay` while budget remains; the first non-5xx
    /// response, or the last 5xx, is returned.
    pub async fn execute(&self, request: &Request) -> Result<Response, TransportError> {
        let method = request.method.as_str();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = self.transport.send(request).await;
            let elapsed = start.elapsed();

            let mut response = match result {
                Ok(response) => response,
                Err(e) => {
                    self.metrics.observe(method, None, elapsed);
                    return Err(e);
                }
            };
            self.metrics.observe(method, Some(response.status), elapsed);
            response.attempts = attempt;

            if !is_server_error(response.status) || attempt > self.max_retry {
                return Ok(response);
            }

            debug!(
                url = %request.url,
                status = response.status,
                attempt,
                "server error, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.cancel.cancelled() => return Ok(response),
            }
        }
    }
}
