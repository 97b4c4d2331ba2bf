use crate::atomic::AtomicF64;
use crate::snapshot::{Bucket, MetricValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bucket ladder, in seconds, covering typical request latencies.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

// Ladders up to this length use a linear scan; longer ones binary search.
const LINEAR_SCAN_MAX: usize = 8;

/// Samples observations into cumulative buckets.
///
/// Each bucket holds a raw (non-cumulative) count; cumulative counts are
/// prefix-summed at snapshot time so concurrent writers can never skew a
/// partially-summed read.
#[derive(Clone)]
pub struct Histogram {
    inner: Arc<HistogramInner>,
}

struct HistogramInner {
    bounds: Vec<f64>,
    // One slot per bound plus a final overflow slot for +Inf.
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

impl Histogram {
    /// Builds a histogram over the given ascending boundaries. An empty
    /// slice selects [`DEFAULT_BUCKETS`]; unsorted input is sorted and
    /// non-finite or duplicate bounds are dropped.
    pub(crate) fn new(bounds: &[f64]) -> Self {
        let mut bounds: Vec<f64> = if bounds.is_empty() {
            DEFAULT_BUCKETS.to_vec()
        } else {
            bounds.to_vec()
        };
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();

        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(HistogramInner {
                bounds,
                counts,
                count: AtomicU64::new(0),
                sum: AtomicF64::new(0.0),
            }),
        }
    }

    pub fn observe(&self, v: f64) {
        let inner = &self.inner;
        let idx = if v.is_nan() {
            inner.bounds.len()
        } else if inner.bounds.len() > LINEAR_SCAN_MAX {
            inner.bounds.partition_point(|b| *b < v)
        } else {
            inner
                .bounds
                .iter()
                .position(|b| v <= *b)
                .unwrap_or(inner.bounds.len())
        };
        inner.counts[idx].fetch_add(1, Ordering::Relaxed);
        inner.count.fetch_add(1, Ordering::Relaxed);
        inner.sum.add(v);
    }

    /// Observes a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Starts a timer that observes the elapsed seconds into this histogram
    /// when stopped or dropped.
    pub fn start_timer(&self) -> HistogramTimer {
        HistogramTimer {
            histogram: self.clone(),
            start: Instant::now(),
            observed: false,
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.inner.sum.get()
    }

    pub fn bounds(&self) -> &[f64] {
        &self.inner.bounds
    }

    pub(crate) fn snapshot_value(&self) -> MetricValue {
        let inner = &self.inner;
        let mut buckets = Vec::with_capacity(inner.bounds.len() + 1);
        let mut cumulative = 0u64;
        for (i, bound) in inner.bounds.iter().enumerate() {
            cumulative += inner.counts[i].load(Ordering::Relaxed);
            buckets.push(Bucket {
                upper_bound: *bound,
                cumulative_count: cumulative,
            });
        }
        cumulative += inner.counts[inner.bounds.len()].load(Ordering::Relaxed);
        buckets.push(Bucket {
            upper_bound: f64::INFINITY,
            cumulative_count: cumulative,
        });

        MetricValue::Histogram {
            sample_count: inner.count.load(Ordering::Relaxed),
            sample_sum: inner.sum.get(),
            buckets,
        }
    }
}

/// Observes the elapsed wall time into the owning histogram, once.
pub struct HistogramTimer {
    histogram: Histogram,
    start: Instant,
    observed: bool,
}

impl HistogramTimer {
    /// Stops the timer, records the elapsed seconds, and returns them.
    pub fn observe_duration(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        if self.observed {
            return 0.0;
        }
        self.observed = true;
        let elapsed = self.start.elapsed().as_secs_f64();
        self.histogram.observe(elapsed);
        elapsed
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.record();
    }
}
