//! Label vectors: one lazily-created primitive per distinct label
//! combination, shared with the owning registry's family map.

use crate::counter::Counter;
use crate::error::{MetricError, Result};
use crate::gauge::Gauge;
use crate::histogram::Histogram;
use crate::snapshot::{label_key, Labels, MetricValue};
use crate::summary::Summary;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Children of one family, keyed by canonical label key. The map is shared
/// between the vector handle and the registry, so creating a child through
/// the vector registers it for gathering at the same time.
pub(crate) type ChildMap<P> = BTreeMap<String, (Labels, P)>;

pub(crate) type SharedChildren<P> = Arc<RwLock<ChildMap<P>>>;

/// Construction recipe shared by all children of one vector, plus the
/// snapshot accessor the registry reads through.
pub trait VecMember: Clone {
    type Spec: Clone + Send + Sync;

    fn build(spec: &Self::Spec) -> Self;

    fn snapshot(&self) -> MetricValue;
}

impl VecMember for Counter {
    type Spec = ();

    fn build(_: &()) -> Self {
        Counter::new()
    }

    fn snapshot(&self) -> MetricValue {
        self.snapshot_value()
    }
}

impl VecMember for Gauge {
    type Spec = ();

    fn build(_: &()) -> Self {
        Gauge::new()
    }

    fn snapshot(&self) -> MetricValue {
        self.snapshot_value()
    }
}

impl VecMember for Histogram {
    type Spec = Vec<f64>;

    fn build(bounds: &Vec<f64>) -> Self {
        Histogram::new(bounds)
    }

    fn snapshot(&self) -> MetricValue {
        self.snapshot_value()
    }
}

impl VecMember for Summary {
    type Spec = Vec<f64>;

    fn build(targets: &Vec<f64>) -> Self {
        Summary::new(targets)
    }

    fn snapshot(&self) -> MetricValue {
        self.snapshot_value()
    }
}

/// A family of primitives differing only by label values. `with` and
/// `with_label_values` resolve (creating on first access) the child for one
/// label combination. Children live for the process lifetime; there is no
/// eviction.
#[derive(Clone)]
pub struct MetricVec<P: VecMember> {
    name: String,
    label_names: Vec<String>,
    spec: P::Spec,
    children: SharedChildren<P>,
}

pub type CounterVec = MetricVec<Counter>;
pub type GaugeVec = MetricVec<Gauge>;
pub type HistogramVec = MetricVec<Histogram>;
pub type SummaryVec = MetricVec<Summary>;

impl<P: VecMember> MetricVec<P> {
    pub(crate) fn new(
        name: String,
        label_names: Vec<String>,
        spec: P::Spec,
        children: SharedChildren<P>,
    ) -> Self {
        Self {
            name,
            label_names,
            spec,
            children,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Resolves the child for `values`, matched positionally against the
    /// declared label names.
    pub fn with_label_values(&self, values: &[&str]) -> Result<P> {
        if values.len() != self.label_names.len() {
            return Err(MetricError::LabelCardinality {
                expected: self.label_names.len(),
                got: values.len(),
            });
        }
        let labels: Labels = self
            .label_names
            .iter()
            .zip(values)
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        self.resolve(labels)
    }

    /// Resolves the child for the given label set, which must carry exactly
    /// the declared label names.
    pub fn with(&self, labels: &Labels) -> Result<P> {
        if labels.len() != self.label_names.len() {
            return Err(MetricError::LabelCardinality {
                expected: self.label_names.len(),
                got: labels.len(),
            });
        }
        for name in labels.keys() {
            if !self.label_names.iter().any(|declared| declared == name) {
                return Err(MetricError::UnknownLabel(name.clone()));
            }
        }
        self.resolve(labels.clone())
    }

    fn resolve(&self, labels: Labels) -> Result<P> {
        let key = label_key(&labels);
        {
            let children = self
                .children
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((_, child)) = children.get(&key) {
                return Ok(child.clone());
            }
        }
        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let (_, child) = children
            .entry(key)
            .or_insert_with(|| (labels, P::build(&self.spec)));
        Ok(child.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::snapshot::{MetricKind, MetricValue};

    #[test]
    fn children_are_cached_per_label_combination() {
        let registry = Registry::new();
        let vec = registry
            .counter_vec("requests_total", "Total requests", &["method", "code"])
            .unwrap();

        let a = vec.with_label_values(&["get", "200"]).unwrap();
        a.inc();
        let b = vec.with_label_values(&["get", "200"]).unwrap();
        b.add(2.0);
        assert_eq!(a.get(), 3.0);

        let other = vec.with_label_values(&["post", "500"]).unwrap();
        other.inc();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].kind, MetricKind::Counter);
        assert_eq!(families[0].metrics.len(), 2);
    }

    #[test]
    fn cardinality_mismatch_is_rejected() {
        let registry = Registry::new();
        let vec = registry
            .gauge_vec("queue_depth", "Queue depth", &["queue"])
            .unwrap();
        let err = vec.with_label_values(&[]).unwrap_err();
        assert!(matches!(
            err,
            MetricError::LabelCardinality {
                expected: 1,
                got: 0
            }
        ));
    }

    #[test]
    fn undeclared_label_is_rejected() {
        let registry = Registry::new();
        let vec = registry
            .gauge_vec("queue_depth", "Queue depth", &["queue"])
            .unwrap();
        let mut labels = Labels::new();
        labels.insert("shard".to_string(), "0".to_string());
        assert!(matches!(
            vec.with(&labels),
            Err(MetricError::UnknownLabel(_))
        ));
    }

    #[test]
    fn histogram_children_share_the_bucket_bounds() {
        let registry = Registry::new();
        let vec = registry
            .histogram_vec("latency_seconds", "Latency", &["route"], &[1.0, 5.0])
            .unwrap();
        let child = vec.with_label_values(&["/a"]).unwrap();
        child.observe(0.5);
        assert_eq!(child.bounds(), &[1.0, 5.0]);

        let families = registry.gather();
        match &families[0].metrics[0].value {
            MetricValue::Histogram { buckets, .. } => assert_eq!(buckets.len(), 3),
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
