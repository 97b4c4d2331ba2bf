use crate::atomic::AtomicF64;
use crate::snapshot::MetricValue;
use std::sync::Arc;
use tracing::debug;

/// A monotonically increasing value.
///
/// Cheap to clone; all clones share the same accumulator. Updates are
/// lock-free and linearizable, so concurrent increments are never lost.
#[derive(Clone, Default)]
pub struct Counter {
    inner: Arc<AtomicF64>,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Adds `v` to the counter. Negative or NaN deltas would break the
    /// monotonicity contract and are ignored.
    pub fn add(&self, v: f64) {
        if v.is_nan() || v < 0.0 {
            debug!(delta = v, "ignoring invalid counter delta");
            return;
        }
        self.inner.add(v);
    }

    pub fn get(&self) -> f64 {
        self.inner.get()
    }

    pub(crate) fn snapshot_value(&self) -> MetricValue {
        MetricValue::Scalar(self.get())
    }
}
