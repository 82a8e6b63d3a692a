use std::collections::BTreeMap;
use std::sync::Mutex;

/// Exact-value histogram: every distinct sample is its own bucket. Buckets
/// are only ever added to during a run.
pub struct Histogram {
    buckets: Mutex<BTreeMap<u64, u64>>,
}

/// Aggregates computed from one consistent read of a [`Histogram`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    /// `(p, value)` for each requested percentile inside `[0, 1]`
    pub percentiles: Vec<(f64, u64)>,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn increment(&self, key: u64) {
        self.add(key, 1);
    }

    pub fn add(&self, key: u64, amount: u64) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        *buckets.entry(key).or_insert(0) += amount;
    }

    #[cfg(test)]
    pub(crate) fn decrement(&self, key: u64) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = buckets.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn count(&self) -> u64 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.values().sum()
    }

    /// Copy of the buckets, ascending by key.
    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn summarize(&self, percentiles: &[f64]) -> Summary {
        summarize(&self.snapshot(), percentiles)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile: rank = floor(p * n + 0.5); the answer is the
/// smallest bucket whose cumulative count reaches that rank.
pub fn percentile(buckets: &BTreeMap<u64, u64>, total: u64, p: f64) -> Option<u64> {
    if !(0.0..=1.0).contains(&p) || total == 0 {
        return None;
    }
    let rank = (p * total as f64 + 0.5).floor() as u64;
    let mut cumulative = 0u64;
    for (key, count) in buckets {
        cumulative += count;
        if cumulative >= rank && *count > 0 {
            return Some(*key);
        }
    }
    buckets.keys().next_back().copied()
}

pub fn summarize(buckets: &BTreeMap<u64, u64>, percentiles: &[f64]) -> Summary {
    let count: u64 = buckets.values().sum();
    if count == 0 {
        return Summary::default();
    }

    let populated = || buckets.iter().filter(|(_, c)| **c > 0);
    let min = populated().map(|(k, _)| *k).next().unwrap_or(0);
    let max = populated().map(|(k, _)| *k).last().unwrap_or(0);

    let sum: f64 = populated().map(|(k, c)| *k as f64 * *c as f64).sum();
    let mean = sum / count as f64;
    let variance: f64 = populated()
        .map(|(k, c)| (*k as f64 - mean).powi(2) * *c as f64)
        .sum::<f64>()
        / count as f64;

    let mut out: Vec<(f64, u64)> = Vec::new();
    for p in percentiles {
        if out.iter().any(|(seen, _)| seen == p) {
            continue;
        }
        if let Some(value) = percentile(buckets, count, *p) {
            out.push((*p, value));
        }
    }

    Summary {
        count,
        min,
        max,
        mean,
        stddev: if count > 1 { variance.sqrt() } else { 0.0 },
        percentiles: out,
    }
}
