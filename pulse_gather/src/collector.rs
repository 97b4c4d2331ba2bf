use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use pulse_core::{MetricFamily, MetricKind, Registry};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Describes one family a collector contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyDesc {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
}

impl FamilyDesc {
    pub fn new(name: &str, help: &str, kind: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
        }
    }
}

/// A source of metric families.
///
/// There is deliberately a single collector shape: `collect` always receives
/// a cancellation token. Sources that can block should poll it and bail out
/// once it fires; cheap in-memory sources may ignore it. Errors cross this
/// boundary as `anyhow::Error`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Descriptors for the families this collector contributes.
    fn describe(&self) -> Vec<FamilyDesc>;

    /// Collects the current metric families.
    async fn collect(&self, cancel: CancellationToken) -> anyhow::Result<Vec<MetricFamily>>;
}

pub type DynCollector = Arc<dyn Collector>;

/// Adapts a closure into a [`Collector`].
pub struct CollectorFn {
    descs: Vec<FamilyDesc>,
    #[allow(clippy::type_complexity)]
    func: Box<
        dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<Vec<MetricFamily>>>
            + Send
            + Sync,
    >,
}

impl CollectorFn {
    pub fn new<F, Fut>(descs: Vec<FamilyDesc>, func: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<MetricFamily>>> + Send + 'static,
    {
        Self {
            descs,
            func: Box::new(move |cancel| func(cancel).boxed()),
        }
    }
}

#[async_trait]
impl Collector for CollectorFn {
    fn describe(&self) -> Vec<FamilyDesc> {
        self.descs.clone()
    }

    async fn collect(&self, cancel: CancellationToken) -> anyhow::Result<Vec<MetricFamily>> {
        (self.func)(cancel).await
    }
}

/// A registry is itself a (deadline-unaware) collector: its snapshot is
/// synchronous and cheap, so the token is ignored.
#[async_trait]
impl Collector for Registry {
    fn describe(&self) -> Vec<FamilyDesc> {
        self.gather()
            .into_iter()
            .map(|family| FamilyDesc {
                name: family.name,
                help: family.help,
                kind: family.kind,
            })
            .collect()
    }

    async fn collect(&self, _cancel: CancellationToken) -> anyhow::Result<Vec<MetricFamily>> {
        Ok(self.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_collects_its_snapshot() {
        let registry = Registry::new();
        registry.counter("jobs_total", "Jobs").unwrap().inc();

        let families = registry
            .collect(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "jobs_total");

        let descs = Collector::describe(&registry);
        assert_eq!(descs, vec![FamilyDesc::new("jobs_total", "Jobs", MetricKind::Counter)]);
    }

    #[tokio::test]
    async fn closure_collector_runs() {
        let collector = CollectorFn::new(
            vec![FamilyDesc::new("up", "Up", MetricKind::Gauge)],
            |_cancel| async {
                let registry = Registry::new();
                registry.gauge("up", "Up")?.set(1.0);
                Ok(registry.gather())
            },
        );
        let families = collector
            .collect(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(families[0].name, "up");
    }
}
