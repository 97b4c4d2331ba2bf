use crate::atomic::AtomicF64;
use crate::snapshot::MetricValue;
use std::sync::Arc;

/// A value that can go up and down.
#[derive(Clone, Default, Debug)]
pub struct Gauge {
    inner: Arc<AtomicF64>,
}

impl Gauge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: f64) {
        self.inner.set(v);
    }

    pub fn inc(&self) {
        self.inner.add(1.0);
    }

    pub fn dec(&self) {
        self.inner.add(-1.0);
    }

    pub fn add(&self, v: f64) {
        self.inner.add(v);
    }

    pub fn sub(&self, v: f64) {
        self.inner.add(-v);
    }

    pub fn get(&self) -> f64 {
        self.inner.get()
    }

    pub(crate) fn snapshot_value(&self) -> MetricValue {
        MetricValue::Scalar(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_add_sub() {
        let gauge = Gauge::new();
        gauge.set(10.0);
        gauge.inc();
        gauge.dec();
        gauge.add(2.5);
        gauge.sub(0.5);
        assert_eq!(gauge.get(), 12.0);
    }

    #[test]
    fn negative_values_are_allowed() {
        let gauge = Gauge::new();
        gauge.sub(3.0);
        assert_eq!(gauge.get(), -3.0);
    }

    #[test]
    fn concurrent_deltas_balance_out() {
        let gauge = Gauge::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let gauge = gauge.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            gauge.inc();
                        } else {
                            gauge.dec();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gauge.get(), 0.0);
    }
}
