//! Lock-free metric primitives, label vectors, and the registry that groups
//! them into named families and snapshots them for exposition.

pub mod counter;
pub mod error;
pub mod gauge;
pub mod histogram;
pub mod registry;
pub mod snapshot;
pub mod summary;
pub mod validate;
pub mod vec;

mod atomic;

pub use counter::Counter;
pub use error::{MetricError, Result};
pub use gauge::Gauge;
pub use histogram::{Histogram, HistogramTimer, DEFAULT_BUCKETS};
pub use registry::{default_registry, Registry, ScopedRegistry};
pub use snapshot::{
    label_key, Bucket, Labels, Metric, MetricFamily, MetricKind, MetricValue, Quantile,
};
pub use summary::{Summary, DEFAULT_QUANTILES};
pub use vec::{CounterVec, GaugeVec, HistogramVec, MetricVec, SummaryVec, VecMember};
