//! Process introspection: CPU time and resident memory for the current
//! process, exposed as a collector.

use crate::collector::{Collector, FamilyDesc};
use async_trait::async_trait;
use pulse_core::{Labels, Metric, MetricFamily, MetricKind, MetricValue};
use sysinfo::{ProcessRefreshKind, System};
use tokio_util::sync::CancellationToken;

const START_TIME: &str = "process_start_time_seconds";
const CPU_SECONDS: &str = "process_cpu_seconds_total";
const RESIDENT_MEMORY: &str = "process_resident_memory_bytes";

/// Reports start time, cumulative CPU seconds, and resident memory of the
/// current process. Families the platform cannot answer are omitted rather
/// than reported as zero.
#[derive(Clone, Copy, Default)]
pub struct ProcessCollector;

impl ProcessCollector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collector for ProcessCollector {
    fn describe(&self) -> Vec<FamilyDesc> {
        vec![
            FamilyDesc::new(
                START_TIME,
                "Start time of the process since unix epoch in seconds.",
                MetricKind::Gauge,
            ),
            FamilyDesc::new(
                CPU_SECONDS,
                "Total user and system CPU time spent in seconds.",
                MetricKind::Counter,
            ),
            FamilyDesc::new(
                RESIDENT_MEMORY,
                "Resident memory size in bytes.",
                MetricKind::Gauge,
            ),
        ]
    }

    async fn collect(&self, _cancel: CancellationToken) -> anyhow::Result<Vec<MetricFamily>> {
        let mut families = Vec::with_capacity(3);

        if let Some(cpu) = cpu_seconds_total() {
            families.push(scalar_family(
                CPU_SECONDS,
                "Total user and system CPU time spent in seconds.",
                MetricKind::Counter,
                cpu,
            ));
        }

        if let Ok(pid) = sysinfo::get_current_pid() {
            let mut system = System::new();
            if system.refresh_process_specifics(pid, ProcessRefreshKind::everything()) {
                if let Some(process) = system.process(pid) {
                    families.push(scalar_family(
                        RESIDENT_MEMORY,
                        "Resident memory size in bytes.",
                        MetricKind::Gauge,
                        process.memory() as f64,
                    ));
                    families.push(scalar_family(
                        START_TIME,
                        "Start time of the process since unix epoch in seconds.",
                        MetricKind::Gauge,
                        process.start_time() as f64,
                    ));
                }
            }
        }

        Ok(families)
    }
}

fn scalar_family(name: &str, help: &str, kind: MetricKind, value: f64) -> MetricFamily {
    MetricFamily {
        name: name.to_string(),
        help: help.to_string(),
        kind,
        metrics: vec![Metric {
            labels: Labels::new(),
            value: MetricValue::Scalar(value),
        }],
    }
}

#[cfg(unix)]
fn cpu_seconds_total() -> Option<f64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let usage = unsafe { usage.assume_init() };
    let seconds = |t: libc::timeval| t.tv_sec as f64 + t.tv_usec as f64 / 1e6;
    Some(seconds(usage.ru_utime) + seconds(usage.ru_stime))
}

#[cfg(not(unix))]
fn cpu_seconds_total() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_process_families() {
        let collector = ProcessCollector::new();
        let families = collector
            .collect(CancellationToken::new())
            .await
            .unwrap();

        for family in &families {
            assert_eq!(family.metrics.len(), 1);
            match &family.metrics[0].value {
                MetricValue::Scalar(v) => assert!(*v >= 0.0),
                other => panic!("unexpected value: {other:?}"),
            }
        }

        #[cfg(unix)]
        {
            let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
            assert!(names.contains(&CPU_SECONDS));
        }
    }

    #[test]
    fn describes_three_families() {
        assert_eq!(ProcessCollector::new().describe().len(), 3);
    }
}
