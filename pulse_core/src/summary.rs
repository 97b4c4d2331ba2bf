use crate::atomic::AtomicF64;
use crate::snapshot::{MetricValue, Quantile};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Default quantile targets reported by a summary.
pub const DEFAULT_QUANTILES: &[f64] = &[0.5, 0.9, 0.99];

const RESERVOIR_CAPACITY: usize = 1024;

/// Tracks count/sum plus approximate quantiles over a sliding reservoir of
/// the most recent observations. The reservoir is a fixed-capacity ring
/// buffer; `observe` overwrites the oldest sample once full.
#[derive(Clone)]
pub struct Summary {
    inner: Arc<SummaryInner>,
}

struct SummaryInner {
    targets: Vec<f64>,
    count: AtomicU64,
    sum: AtomicF64,
    reservoir: Mutex<Reservoir>,
}

struct Reservoir {
    samples: Vec<f64>,
    next: usize,
}

impl Summary {
    /// Builds a summary for the given quantile targets (each in [0, 1]).
    /// An empty slice selects [`DEFAULT_QUANTILES`].
    pub(crate) fn new(targets: &[f64]) -> Self {
        let mut targets: Vec<f64> = if targets.is_empty() {
            DEFAULT_QUANTILES.to_vec()
        } else {
            targets.to_vec()
        };
        targets.sort_by(f64::total_cmp);
        targets.dedup();

        Self {
            inner: Arc::new(SummaryInner {
                targets,
                count: AtomicU64::new(0),
                sum: AtomicF64::new(0.0),
                reservoir: Mutex::new(Reservoir {
                    samples: Vec::new(),
                    next: 0,
                }),
            }),
        }
    }

    pub fn observe(&self, v: f64) {
        let inner = &self.inner;
        inner.count.fetch_add(1, Ordering::Relaxed);
        inner.sum.add(v);

        let mut reservoir = inner
            .reservoir
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reservoir.samples.len() < RESERVOIR_CAPACITY {
            reservoir.samples.push(v);
        } else {
            let slot = reservoir.next;
            reservoir.samples[slot] = v;
            reservoir.next = (slot + 1) % RESERVOIR_CAPACITY;
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.inner.sum.get()
    }

    /// Estimates the quantile `q` over the current reservoir, or `None` when
    /// nothing has been observed yet.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let sorted = self.sorted_samples();
        if sorted.is_empty() {
            return None;
        }
        Some(pick_quantile(&sorted, q))
    }

    fn sorted_samples(&self) -> Vec<f64> {
        let reservoir = self
            .inner
            .reservoir
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sorted = reservoir.samples.clone();
        drop(reservoir);
        sorted.sort_by(f64::total_cmp);
        sorted
    }

    pub(crate) fn snapshot_value(&self) -> MetricValue {
        let sorted = self.sorted_samples();
        let quantiles = if sorted.is_empty() {
            Vec::new()
        } else {
            self.inner
                .targets
                .iter()
                .map(|q| Quantile {
                    quantile: *q,
                    value: pick_quantile(&sorted, *q),
                })
                .collect()
        };

        MetricValue::Summary {
            sample_count: self.inner.count.load(Ordering::Relaxed),
            sample_sum: self.inner.sum.get(),
            quantiles,
        }
    }
}

/// Nearest-rank pick over sorted data: index `ceil(q·n) - 1` clamped to the
/// valid range; q ≤ 0 selects the minimum, q ≥ 1 the maximum.
fn pick_quantile(sorted: &[f64], q: f64) -> f64 {
    if q <= 0.0 {
        return sorted[0];
    }
    if q >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
