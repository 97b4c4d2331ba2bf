//! Fan-out gathering over a set of registered collectors with panic
//! isolation and a deadline-guarded merge.

use crate::collector::DynCollector;
use crate::error::{GatherError, Result};
use futures::FutureExt;
use pulse_core::MetricFamily;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle returned by [`CollectorHub::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorId(u64);

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal state of one gather call.
#[derive(Debug)]
pub enum GatherOutcome {
    /// Every collector reported in time.
    Complete,
    /// The deadline expired (or the caller cancelled) before all collectors
    /// reported; the report carries whatever arrived in time.
    TimedOut,
    /// At least one collector failed or panicked; the report still carries
    /// the other collectors' families.
    Errored(GatherError),
}

/// Families gathered by one call plus how the call ended.
#[derive(Debug)]
pub struct GatherReport {
    pub families: Vec<MetricFamily>,
    pub outcome: GatherOutcome,
}

impl GatherReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, GatherOutcome::Complete)
    }

    /// Collapses the report into the strict form: anything short of a
    /// complete gather becomes an error and the partial families are
    /// discarded.
    pub fn into_result(self) -> Result<Vec<MetricFamily>> {
        match self.outcome {
            GatherOutcome::Complete => Ok(self.families),
            GatherOutcome::TimedOut => Err(GatherError::DeadlineExceeded),
            GatherOutcome::Errored(error) => Err(error),
        }
    }
}

/// A concurrent set of collectors gathered together.
///
/// Each gather call snapshots the registered set, spawns one task per
/// collector, and merges forwarded families until the set is drained or the
/// deadline expires. A panicking collector is converted into a captured
/// error and can never take down the gather or its peers.
#[derive(Clone, Default)]
pub struct CollectorHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    entries: RwLock<Vec<HubEntry>>,
    next_id: AtomicU64,
    pedantic: bool,
}

#[derive(Clone)]
struct HubEntry {
    id: CollectorId,
    collector: DynCollector,
}

enum Event {
    Family(MetricFamily),
    Failed { id: CollectorId, error: anyhow::Error },
}

impl CollectorHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`CollectorHub::new`], but `register` additionally rejects a
    /// collector describing a family name another collector already
    /// provides.
    pub fn pedantic() -> Self {
        Self {
            inner: Arc::new(HubInner {
                pedantic: true,
                ..HubInner::default()
            }),
        }
    }

    pub fn register(&self, collector: DynCollector) -> Result<CollectorId> {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.pedantic {
            let existing: Vec<String> = entries
                .iter()
                .flat_map(|entry| entry.collector.describe())
                .map(|desc| desc.name)
                .collect();
            for desc in collector.describe() {
                if existing.contains(&desc.name) {
                    return Err(GatherError::DuplicateFamily(desc.name));
                }
            }
        }
        let id = CollectorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(HubEntry { id, collector });
        Ok(id)
    }

    /// Removes a collector; returns false when the id is unknown.
    pub fn unregister(&self, id: CollectorId) -> bool {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Strict gather without a deadline: the first collector failure aborts
    /// and is returned to the caller.
    pub async fn gather(&self) -> Result<Vec<MetricFamily>> {
        self.run(CancellationToken::new(), None, true)
            .await
            .into_result()
    }

    /// Gathers until `deadline`, returning partial families plus a timeout
    /// indicator when it expires.
    pub async fn gather_with_deadline(&self, deadline: Instant) -> GatherReport {
        self.run(CancellationToken::new(), Some(deadline), false).await
    }

    pub async fn gather_with_timeout(&self, timeout: Duration) -> GatherReport {
        self.gather_with_deadline(Instant::now() + timeout).await
    }

    /// Gathers until `cancel` fires, reporting rather than failing on
    /// collector errors.
    pub(crate) async fn run(
        &self,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        fail_fast: bool,
    ) -> GatherReport {
        let entries: Vec<HubEntry> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return GatherReport {
                    families: Vec::new(),
                    outcome: GatherOutcome::TimedOut,
                };
            }
        }
        if entries.is_empty() {
            return GatherReport {
                families: Vec::new(),
                outcome: GatherOutcome::Complete,
            };
        }

        let (tx, mut rx) = mpsc::channel::<Event>(entries.len() * 4);
        for entry in entries {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(entry.collector.collect(cancel.clone()))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(families)) => {
                        for family in families {
                            tokio::select! {
                                sent = tx.send(Event::Family(family)) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                                _ = cancel.cancelled() => return,
                            }
                        }
                    }
                    Ok(Err(error)) => {
                        let _ = tx.send(Event::Failed { id: entry.id, error }).await;
                    }
                    Err(panic) => {
                        let error =
                            anyhow::anyhow!("collector panicked: {}", panic_message(&panic));
                        let _ = tx.send(Event::Failed { id: entry.id, error }).await;
                    }
                }
            });
        }
        drop(tx);

        let deadline_expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline_expired);

        let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();
        let mut first_error: Option<GatherError> = None;
        let mut timed_out = false;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    None => break,
                    Some(Event::Family(family)) => merge_family(&mut merged, family),
                    Some(Event::Failed { id, error }) => {
                        warn!(collector = %id, error = %error, "collector failed while gathering");
                        if first_error.is_none() {
                            first_error = Some(GatherError::Collector { id, source: error });
                        }
                        if fail_fast {
                            cancel.cancel();
                            break;
                        }
                    }
                },
                _ = &mut deadline_expired => {
                    timed_out = true;
                    cancel.cancel();
                    break;
                }
                _ = cancel.cancelled() => {
                    timed_out = true;
                    break;
                }
            }
        }

        let families = merged.into_values().collect();
        let outcome = if timed_out {
            GatherOutcome::TimedOut
        } else if let Some(error) = first_error {
            GatherOutcome::Errored(error)
        } else {
            GatherOutcome::Complete
        };
        GatherReport { families, outcome }
    }
}

/// Merges a forwarded family into the result set. The first family to
/// arrive under a name fixes the help text and kind; later arrivals only
/// contribute their metrics.
fn merge_family(merged: &mut BTreeMap<String, MetricFamily>, family: MetricFamily) {
    match merged.entry(family.name.clone()) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(family);
        }
        std::collections::btree_map::Entry::Occupied(mut slot) => {
            slot.get_mut().metrics.extend(family.metrics);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorFn, FamilyDesc};
    use pulse_core::{MetricKind, Registry};

    fn registry_with_gauge(name: &'static str, value: f64) -> Registry {
        let registry = Registry::new();
        registry.gauge(name, "A gauge").unwrap().set(value);
        registry
    }

    fn sleepy_collector(delay: Duration) -> DynCollector {
        Arc::new(CollectorFn::new(
            vec![FamilyDesc::new("slow_metric", "Slow", MetricKind::Gauge)],
            move |_cancel| async move {
                tokio::time::sleep(delay).await;
                let registry = Registry::new();
                registry.gauge("slow_metric", "Slow")?.set(1.0);
                Ok(registry.gather())
            },
        ))
    }

    fn panicking_collector() -> DynCollector {
        Arc::new(CollectorFn::new(
            vec![FamilyDesc::new("doomed", "Doomed", MetricKind::Gauge)],
            |_cancel| async { panic!("boom") },
        ))
    }

    #[tokio::test]
    async fn gathers_and_sorts_all_collectors() {
        let hub = CollectorHub::new();
        hub.register(Arc::new(registry_with_gauge("zebra", 1.0)))
            .unwrap();
        hub.register(Arc::new(registry_with_gauge("alpha", 2.0)))
            .unwrap();

        let families = hub.gather().await.unwrap();
        let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zebra"]);
    }

    #[tokio::test]
    async fn same_family_from_two_collectors_is_merged() {
        let hub = CollectorHub::new();
        let a = Registry::new();
        a.gauge_vec("up", "Up", &["source"])
            .unwrap()
            .with_label_values(&["a"])
            .unwrap()
            .set(1.0);
        let b = Registry::new();
        b.gauge_vec("up", "Up", &["source"])
            .unwrap()
            .with_label_values(&["b"])
            .unwrap()
            .set(1.0);
        hub.register(Arc::new(a)).unwrap();
        hub.register(Arc::new(b)).unwrap();

        let families = hub.gather().await.unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].metrics.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_partial_families_and_timeout() {
        let hub = CollectorHub::new();
        hub.register(Arc::new(registry_with_gauge("fast_metric", 1.0)))
            .unwrap();
        hub.register(sleepy_collector(Duration::from_secs(10))).unwrap();

        let report = hub.gather_with_timeout(Duration::from_millis(50)).await;
        assert!(matches!(report.outcome, GatherOutcome::TimedOut));
        let names: Vec<&str> = report.families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["fast_metric"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_returns_immediately() {
        let hub = CollectorHub::new();
        hub.register(sleepy_collector(Duration::from_secs(10))).unwrap();

        let report = hub.gather_with_deadline(Instant::now()).await;
        assert!(matches!(report.outcome, GatherOutcome::TimedOut));
        assert!(report.families.is_empty());
    }

    #[tokio::test]
    async fn panicking_collector_is_isolated() {
        let hub = CollectorHub::new();
        hub.register(panicking_collector()).unwrap();
        hub.register(Arc::new(registry_with_gauge("healthy", 1.0)))
            .unwrap();

        let report = hub.gather_with_timeout(Duration::from_secs(5)).await;
        match &report.outcome {
            GatherOutcome::Errored(GatherError::Collector { source, .. }) => {
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The healthy collector's families survive.
        let names: Vec<&str> = report.families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["healthy"]);
    }

    #[tokio::test]
    async fn strict_gather_surfaces_collector_errors() {
        let hub = CollectorHub::new();
        hub.register(Arc::new(CollectorFn::new(Vec::new(), |_cancel| async {
            Err(anyhow::anyhow!("backend unreachable"))
        })))
        .unwrap();

        let err = hub.gather().await.unwrap_err();
        assert!(err.to_string().contains("backend unreachable"));
    }

    #[tokio::test]
    async fn unregister_removes_the_collector() {
        let hub = CollectorHub::new();
        let id = hub
            .register(Arc::new(registry_with_gauge("gone", 1.0)))
            .unwrap();
        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(hub.gather().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pedantic_hub_rejects_duplicate_families() {
        let hub = CollectorHub::pedantic();
        hub.register(Arc::new(registry_with_gauge("up", 1.0)))
            .unwrap();
        let err = hub
            .register(Arc::new(registry_with_gauge("up", 2.0)))
            .unwrap_err();
        assert!(matches!(err, GatherError::DuplicateFamily(name) if name == "up"));
    }
}
