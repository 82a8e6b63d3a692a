use hdrhistogram::Histogram as HdrHistogram;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Upper bounds of the attempt-level duration histogram, in seconds.
pub const DURATION_BUCKETS: [f64; 17] = [
    0.001, 0.0025, 0.005, 0.0075, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0,
    7.5, 10.0,
];

// one slot per bound plus +Inf
const BUCKET_SLOTS: usize = 18;

/// Quantiles reported from the per-method summary.
pub const SUMMARY_QUANTILES: [f64; 6] = [0.5, 0.75, 0.9, 0.95, 0.99, 1.0];

// microseconds, one hour ceiling
const SUMMARY_MAX_MICROS: u64 = 3_600_000_000;

struct Series {
    /// Per-bucket (non-cumulative) counts; the last slot is +Inf
    buckets: [u64; BUCKET_SLOTS],
    sum: Duration,
    count: u64,
    summary: Option<HdrHistogram<u64>>,
}

impl Series {
    fn new() -> Self {
        let summary = match HdrHistogram::new_with_bounds(1, SUMMARY_MAX_MICROS, 3) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "failed to allocate latency summary");
                None
            }
        };
        Self {
            buckets: [0; BUCKET_SLOTS],
            sum: Duration::ZERO,
            count: 0,
            summary,
        }
    }

    fn observe(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let idx = DURATION_BUCKETS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(DURATION_BUCKETS.len());
        self.buckets[idx] += 1;
        self.sum += elapsed;
        self.count += 1;
        if let Some(summary) = self.summary.as_mut() {
            let micros = (elapsed.as_micros() as u64).clamp(1, SUMMARY_MAX_MICROS);
            summary.saturating_record(micros);
        }
    }
}

/// Per-attempt metrics for outbound calls. One instance per run, shared by
/// the client and the run's [`Stats`](crate::Stats).
pub struct TransportMetrics {
    status: Mutex<BTreeMap<(String, String), u64>>,
    series: Mutex<BTreeMap<String, Series>>,
}

/// Point-in-time copy of one method's duration series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub method: String,
    /// `(upper bound, count)`; `None` is the +Inf bucket
    pub buckets: Vec<(Option<Duration>, u64)>,
    pub sum: Duration,
    pub count: u64,
    pub quantiles: Vec<(f64, Duration)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSnapshot {
    /// `(method, code) -> attempts`; code `"0"` is a transport failure
    pub status: BTreeMap<(String, String), u64>,
    pub series: Vec<SeriesSnapshot>,
}

impl TransportSnapshot {
    pub fn attempts(&self) -> u64 {
        self.status.values().sum()
    }
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(BTreeMap::new()),
            series: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record one completed attempt. `status` is `None` for a transport failure.
    pub fn observe(&self, method: &str, status: Option<u16>, elapsed: Duration) {
        let method = method.to_ascii_lowercase();
        let code = status.map_or_else(|| "0".to_string(), |s| s.to_string());
        {
            let mut counters = self.status.lock().unwrap_or_else(|e| e.into_inner());
            *counters.entry((method.clone(), code)).or_insert(0) += 1;
        }
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series
            .entry(method)
            .or_insert_with(Series::new)
            .observe(elapsed);
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        let series = series
            .iter()
            .map(|(method, s)| {
                let buckets = DURATION_BUCKETS
                    .iter()
                    .map(|b| Some(Duration::from_secs_f64(*b)))
                    .chain(std::iter::once(None))
                    .zip(s.buckets.iter().copied())
                    .collect();
                let quantiles = match &s.summary {
                    Some(h) if !h.is_empty() => SUMMARY_QUANTILES
                        .iter()
                        .map(|q| (*q, Duration::from_micros(h.value_at_quantile(*q))))
                        .collect(),
                    _ => Vec::new(),
                };
                SeriesSnapshot {
                    method: method.clone(),
                    buckets,
                    sum: s.sum,
                    count: s.count,
                    quantiles,
                }
            })
            .collect();
        TransportSnapshot { status, series }
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}
