//! The registry owns named metric families, enforces name/kind uniqueness,
//! and produces point-in-time snapshots.

use crate::counter::Counter;
use crate::error::{MetricError, Result};
use crate::gauge::Gauge;
use crate::histogram::Histogram;
use crate::snapshot::{Labels, Metric, MetricFamily, MetricKind};
use crate::summary::Summary;
use crate::validate;
use crate::vec::{CounterVec, GaugeVec, HistogramVec, MetricVec, SharedChildren, SummaryVec, VecMember};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

/// A concurrent collection of metric families.
///
/// Cheap to clone; all clones share the same interior state. Structural
/// mutation (new family, new label combination) takes a write lock; reading
/// metric values goes through each primitive's own atomic accessors, so
/// gathering never blocks writers.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    kinds: BTreeMap<String, MetricKind>,
    counters: BTreeMap<String, FamilyCell<Counter>>,
    gauges: BTreeMap<String, FamilyCell<Gauge>>,
    histograms: BTreeMap<String, FamilyCell<Histogram>>,
    summaries: BTreeMap<String, FamilyCell<Summary>>,
}

struct FamilyCell<P: VecMember> {
    help: String,
    spec: P::Spec,
    children: SharedChildren<P>,
}

impl<P: VecMember> FamilyCell<P> {
    fn new(help: &str, spec: P::Spec) -> Self {
        Self {
            help: help.to_string(),
            spec,
            children: Arc::default(),
        }
    }
}

impl RegistryState {
    fn check_kind(&mut self, name: &str, kind: MetricKind) -> Result<()> {
        match self.kinds.get(name) {
            Some(existing) if *existing != kind => Err(MetricError::AlreadyRegistered {
                name: name.to_string(),
                existing: *existing,
            }),
            Some(_) => Ok(()),
            None => {
                self.kinds.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or joins) an unlabeled counter family.
    pub fn counter(&self, name: &str, help: &str) -> Result<Counter> {
        self.counter_vec(name, help, &[])?.with(&Labels::new())
    }

    pub fn counter_vec(&self, name: &str, help: &str, label_names: &[&str]) -> Result<CounterVec> {
        let label_names = validated_label_names(name, label_names)?;
        let mut state = self.write();
        state.check_kind(name, MetricKind::Counter)?;
        let cell = state
            .counters
            .entry(name.to_string())
            .or_insert_with(|| FamilyCell::new(help, ()));
        Ok(MetricVec::new(
            name.to_string(),
            label_names,
            cell.spec.clone(),
            cell.children.clone(),
        ))
    }

    /// Creates (or joins) an unlabeled gauge family.
    pub fn gauge(&self, name: &str, help: &str) -> Result<Gauge> {
        self.gauge_vec(name, help, &[])?.with(&Labels::new())
    }

    pub fn gauge_vec(&self, name: &str, help: &str, label_names: &[&str]) -> Result<GaugeVec> {
        let label_names = validated_label_names(name, label_names)?;
        let mut state = self.write();
        state.check_kind(name, MetricKind::Gauge)?;
        let cell = state
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| FamilyCell::new(help, ()));
        Ok(MetricVec::new(
            name.to_string(),
            label_names,
            cell.spec.clone(),
            cell.children.clone(),
        ))
    }

    /// Creates (or joins) an unlabeled histogram family. An empty `bounds`
    /// slice selects the default bucket ladder. When the family already
    /// exists its original bounds win.
    pub fn histogram(&self, name: &str, help: &str, bounds: &[f64]) -> Result<Histogram> {
        self.histogram_vec(name, help, &[], bounds)?
            .with(&Labels::new())
    }

    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        bounds: &[f64],
    ) -> Result<HistogramVec> {
        let label_names = validated_label_names(name, label_names)?;
        let mut state = self.write();
        state.check_kind(name, MetricKind::Histogram)?;
        let cell = state
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| FamilyCell::new(help, bounds.to_vec()));
        Ok(MetricVec::new(
            name.to_string(),
            label_names,
            cell.spec.clone(),
            cell.children.clone(),
        ))
    }

    /// Creates (or joins) an unlabeled summary family. An empty `targets`
    /// slice selects the default quantile targets.
    pub fn summary(&self, name: &str, help: &str, targets: &[f64]) -> Result<Summary> {
        self.summary_vec(name, help, &[], targets)?
            .with(&Labels::new())
    }

    pub fn summary_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        targets: &[f64],
    ) -> Result<SummaryVec> {
        let label_names = validated_label_names(name, label_names)?;
        let mut state = self.write();
        state.check_kind(name, MetricKind::Summary)?;
        let cell = state
            .summaries
            .entry(name.to_string())
            .or_insert_with(|| FamilyCell::new(help, targets.to_vec()));
        Ok(MetricVec::new(
            name.to_string(),
            label_names,
            cell.spec.clone(),
            cell.children.clone(),
        ))
    }

    /// Returns a creation facade that prefixes every metric name with
    /// `namespace_`.
    pub fn scoped(&self, namespace: &str) -> ScopedRegistry {
        ScopedRegistry {
            registry: self.clone(),
            namespace: namespace.to_string(),
        }
    }

    /// Snapshots every family, sorted by name. Values are read through the
    /// primitives' atomic accessors; concurrent mutation during a gather is
    /// safe and no field is ever torn. Families with no children yet are
    /// omitted.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut families = Vec::new();
        collect_families(&state.counters, MetricKind::Counter, &mut families);
        collect_families(&state.gauges, MetricKind::Gauge, &mut families);
        collect_families(&state.histograms, MetricKind::Histogram, &mut families);
        collect_families(&state.summaries, MetricKind::Summary, &mut families);
        families.sort_by(|a, b| a.name.cmp(&b.name));
        families
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn collect_families<P: VecMember>(
    map: &BTreeMap<String, FamilyCell<P>>,
    kind: MetricKind,
    out: &mut Vec<MetricFamily>,
) {
    for (name, cell) in map {
        let children = cell.children.read().unwrap_or_else(PoisonError::into_inner);
        if children.is_empty() {
            continue;
        }
        let metrics = children
            .values()
            .map(|(labels, primitive)| Metric {
                labels: labels.clone(),
                value: primitive.snapshot(),
            })
            .collect();
        out.push(MetricFamily {
            name: name.clone(),
            help: cell.help.clone(),
            kind,
            metrics,
        });
    }
}

fn validated_label_names(name: &str, label_names: &[&str]) -> Result<Vec<String>> {
    validate::metric_name(name)?;
    for label in label_names {
        validate::label_name(label)?;
    }
    Ok(label_names.iter().map(|l| l.to_string()).collect())
}

/// Namespace-prefixing creation facade over an explicit [`Registry`].
#[derive(Clone)]
pub struct ScopedRegistry {
    registry: Registry,
    namespace: String,
}

impl ScopedRegistry {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefixed(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    pub fn counter(&self, name: &str, help: &str) -> Result<Counter> {
        self.registry.counter(&self.prefixed(name), help)
    }

    pub fn counter_vec(&self, name: &str, help: &str, label_names: &[&str]) -> Result<CounterVec> {
        self.registry
            .counter_vec(&self.prefixed(name), help, label_names)
    }

    pub fn gauge(&self, name: &str, help: &str) -> Result<Gauge> {
        self.registry.gauge(&self.prefixed(name), help)
    }

    pub fn gauge_vec(&self, name: &str, help: &str, label_names: &[&str]) -> Result<GaugeVec> {
        self.registry
            .gauge_vec(&self.prefixed(name), help, label_names)
    }

    pub fn histogram(&self, name: &str, help: &str, bounds: &[f64]) -> Result<Histogram> {
        self.registry.histogram(&self.prefixed(name), help, bounds)
    }

    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        bounds: &[f64],
    ) -> Result<HistogramVec> {
        self.registry
            .histogram_vec(&self.prefixed(name), help, label_names, bounds)
    }

    pub fn summary(&self, name: &str, help: &str, targets: &[f64]) -> Result<Summary> {
        self.registry.summary(&self.prefixed(name), help, targets)
    }

    pub fn summary_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        targets: &[f64],
    ) -> Result<SummaryVec> {
        self.registry
            .summary_vec(&self.prefixed(name), help, label_names, targets)
    }
}

static DEFAULT_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Process-wide convenience registry for the application edge. Library code
/// should take an explicit [`Registry`] instead.
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}
