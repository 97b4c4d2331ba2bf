//! Composite gathering: merge several gatherers under namespace prefixes.

use crate::error::{GatherError, Result};
use crate::hub::{CollectorHub, GatherOutcome, GatherReport};
use async_trait::async_trait;
use pulse_core::{validate, MetricFamily, Registry};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Anything that can produce a gather report. The cancellation token is the
/// caller's deadline carrier; implementations observe it cooperatively.
#[async_trait]
pub trait Gatherer: Send + Sync {
    async fn gather(&self, cancel: CancellationToken) -> GatherReport;
}

pub type DynGatherer = Arc<dyn Gatherer>;

#[async_trait]
impl Gatherer for Registry {
    async fn gather(&self, _cancel: CancellationToken) -> GatherReport {
        GatherReport {
            families: Registry::gather(self),
            outcome: GatherOutcome::Complete,
        }
    }
}

#[async_trait]
impl Gatherer for CollectorHub {
    async fn gather(&self, cancel: CancellationToken) -> GatherReport {
        self.run(cancel, None, false).await
    }
}

/// Merges the output of registered gatherers, prefixing each contributed
/// family name with `<namespace>_`. Duplicate namespaces are rejected; the
/// final result is sorted by name.
#[derive(Clone, Default)]
pub struct MultiGatherer {
    inner: Arc<RwLock<BTreeMap<String, DynGatherer>>>,
}

impl MultiGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `gatherer` under `namespace`. An empty namespace merges the
    /// families unprefixed.
    pub fn register(&self, namespace: &str, gatherer: DynGatherer) -> Result<()> {
        if !namespace.is_empty() {
            validate::metric_name(namespace)?;
        }
        let mut gatherers = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if gatherers.contains_key(namespace) {
            return Err(GatherError::DuplicateNamespace(namespace.to_string()));
        }
        gatherers.insert(namespace.to_string(), gatherer);
        Ok(())
    }

    /// Creates a fresh registry and registers it under `namespace`.
    pub fn make_and_register(&self, namespace: &str) -> Result<Registry> {
        let registry = Registry::new();
        self.register(namespace, Arc::new(registry.clone()))?;
        Ok(registry)
    }

    /// Removes the gatherer under `namespace`; returns whether one existed.
    pub fn deregister(&self, namespace: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some()
    }
}

#[async_trait]
impl Gatherer for MultiGatherer {
    async fn gather(&self, cancel: CancellationToken) -> GatherReport {
        let gatherers: Vec<(String, DynGatherer)> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(namespace, gatherer)| (namespace.clone(), gatherer.clone()))
            .collect();

        let mut families: Vec<MetricFamily> = Vec::new();
        let mut outcome = GatherOutcome::Complete;
        for (namespace, gatherer) in gatherers {
            if cancel.is_cancelled() {
                outcome = GatherOutcome::TimedOut;
                break;
            }
            let report = gatherer.gather(cancel.clone()).await;
            let mut contributed = report.families;
            if !namespace.is_empty() {
                for family in &mut contributed {
                    family.name = format!("{}_{}", namespace, family.name);
                }
            }
            families.extend(contributed);
            match report.outcome {
                GatherOutcome::Complete => {}
                GatherOutcome::TimedOut => {
                    outcome = GatherOutcome::TimedOut;
                    break;
                }
                GatherOutcome::Errored(error) => {
                    outcome = GatherOutcome::Errored(GatherError::Namespace {
                        namespace,
                        source: Box::new(error),
                    });
                    break;
                }
            }
        }

        families.sort_by(|a, b| a.name.cmp(&b.name));
        GatherReport { families, outcome }
    }
}
