use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::histogram::{Histogram, Summary};

/// Rate samples are stored as milli-jobs per second so they fit the integer
/// histogram.
const RATE_SCALE: f64 = 1000.0;

/// Throughput samples, one per tick of a [`RateSampler`].
#[derive(Default)]
pub struct RateHistogram {
    samples: Histogram,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateSummary {
    pub samples: u64,
    pub mean: f64,
    pub stddev: f64,
    pub max: f64,
}

impl RateHistogram {
    pub fn record(&self, per_second: f64) {
        let scaled = (per_second.max(0.0) * RATE_SCALE).round() as u64;
        self.samples.increment(scaled);
    }

    pub fn summary(&self) -> RateSummary {
        let Summary {
            count,
            max,
            mean,
            stddev,
            ..
        } = self.samples.summarize(&[]);
        RateSummary {
            samples: count,
            mean: mean / RATE_SCALE,
            stddev: stddev / RATE_SCALE,
            max: max as f64 / RATE_SCALE,
        }
    }
}

/// Background task sampling `completed` every `interval` and feeding
/// "completions since last tick / time since last tick" into `rates`.
pub struct RateSampler {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl RateSampler {
    pub fn start(
        completed: Arc<AtomicU64>,
        rates: Arc<RateHistogram>,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last_count = completed.load(Ordering::Relaxed);
            let mut last_tick = Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                let now = Instant::now();
                let count = completed.load(Ordering::Relaxed);
                let elapsed = now.duration_since(last_tick).as_secs_f64();
                if elapsed > 0.0 {
                    rates.record(count.saturating_sub(last_count) as f64 / elapsed);
                }
                last_count = count;
                last_tick = now;
            }
            debug!("rate sampler stopped");
        });
        Self { handle, stop }
    }

    /// Stop sampling and wait for the task to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}
