use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::histogram::{Histogram, Summary};
use crate::metrics::{TransportMetrics, TransportSnapshot};
use crate::rate::{RateHistogram, RateSampler, RateSummary};

/// Status code used for jobs that never got an HTTP response.
pub const TRANSPORT_FAILURE: u16 = 0;

/// Thread-safe tally keyed by `K`.
pub struct Counter<K> {
    m: Mutex<HashMap<K, u64>>,
}

impl<K: Eq + Hash + Clone> Counter<K> {
    pub fn new() -> Self {
        Self {
            m: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment(&self, key: K) {
        self.add(key, 1);
    }

    pub fn add(&self, key: K, amount: u64) {
        let mut m = self.m.lock().unwrap_or_else(|e| e.into_inner());
        *m.entry(key).or_insert(0) += amount;
    }

    pub fn snapshot(&self) -> HashMap<K, u64> {
        self.m.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<K: Eq + Hash + Clone> Default for Counter<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency samples keyed by nanoseconds.
#[derive(Default)]
pub struct LatencyHistogram {
    samples: Histogram,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub stddev: Duration,
    pub percentiles: Vec<(f64, Duration)>,
}

impl LatencyHistogram {
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.samples.increment(nanos);
    }

    pub fn summary(&self, percentiles: &[f64]) -> LatencySummary {
        let Summary {
            count,
            min,
            max,
            mean,
            stddev,
            percentiles,
        } = self.samples.summarize(percentiles);
        LatencySummary {
            count,
            min: Duration::from_nanos(min),
            max: Duration::from_nanos(max),
            mean: Duration::from_secs_f64(mean / 1e9),
            stddev: Duration::from_secs_f64(stddev / 1e9),
            percentiles: percentiles
                .into_iter()
                .map(|(p, v)| (p, Duration::from_nanos(v)))
                .collect(),
        }
    }
}

/// All job-level counters for one run, plus the attempt-level transport
/// metrics. Share it behind an `Arc`; every method takes `&self`.
pub struct Stats {
    pub codes: Counter<u16>,
    pub errors: Counter<String>,
    pub latencies: LatencyHistogram,
    pub rates: Arc<RateHistogram>,
    completed: Arc<AtomicU64>,
    transport: Arc<TransportMetrics>,
}

/// Consistent copy of [`Stats`] for reporting.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub codes: BTreeMap<u16, u64>,
    /// Most frequent first
    pub errors: Vec<(String, u64)>,
    pub latency: LatencySummary,
    pub rate: RateSummary,
    pub completed: u64,
    pub transport: TransportSnapshot,
}

impl StatsSnapshot {
    /// Jobs accounted for in the code counter, transport failures included.
    pub fn outcomes(&self) -> u64 {
        self.codes.values().sum()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            codes: Counter::new(),
            errors: Counter::new(),
            latencies: LatencyHistogram::default(),
            rates: Arc::new(RateHistogram::default()),
            completed: Arc::new(AtomicU64::new(0)),
            transport: Arc::new(TransportMetrics::new()),
        }
    }

    /// Handle for the client so attempts land in this run's metrics.
    pub fn transport(&self) -> Arc<TransportMetrics> {
        self.transport.clone()
    }

    pub fn record_status(&self, status: u16, elapsed: Duration) {
        self.codes.increment(status);
        self.latencies.record(elapsed);
    }

    /// A job without a response: counted under status 0 and by error value.
    /// No latency sample is taken.
    pub fn record_failure(&self, error: &str) {
        self.codes.increment(TRANSPORT_FAILURE);
        self.errors.increment(error.to_string());
    }

    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn start_rate_sampler(&self, interval: Duration) -> RateSampler {
        RateSampler::start(self.completed.clone(), self.rates.clone(), interval)
    }

    pub fn snapshot(&self, percentiles: &[f64]) -> StatsSnapshot {
        let mut errors: Vec<(String, u64)> = self.errors.snapshot().into_iter().collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        StatsSnapshot {
            codes: self.codes.snapshot().into_iter().collect(),
            errors,
            latency: self.latencies.summary(percentiles),
            rate: self.rates.summary(),
            completed: self.completed(),
            transport: self.transport.snapshot(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
