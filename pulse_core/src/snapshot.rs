//! Point-in-time snapshot model produced by `Registry::gather` and consumed
//! by the exposition codec.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A set of label name/value pairs identifying one series within a family.
///
/// `BTreeMap` keeps the pairs in canonical (sorted) order, so two label sets
/// with the same content always compare and render identically.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
            MetricKind::Untyped => "untyped",
        }
    }

    /// Parses the lowercase kind name used by the text format.
    pub fn from_name(name: &str) -> Option<MetricKind> {
        match name {
            "counter" => Some(MetricKind::Counter),
            "gauge" => Some(MetricKind::Gauge),
            "histogram" => Some(MetricKind::Histogram),
            "summary" => Some(MetricKind::Summary),
            "untyped" => Some(MetricKind::Untyped),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One histogram bucket: observations ≤ `upper_bound`, inclusive of all
/// lower buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// One estimated quantile of a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Scalar(f64),
    Histogram {
        sample_count: u64,
        sample_sum: f64,
        buckets: Vec<Bucket>,
    },
    Summary {
        sample_count: u64,
        sample_sum: f64,
        quantiles: Vec<Quantile>,
    },
}

/// A single series: a canonical label set plus one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub labels: Labels,
    pub value: MetricValue,
}

/// All metrics sharing one name, help text, and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub metrics: Vec<Metric>,
}

/// Canonical key for a label set: sorted `name="value"` pairs joined with
/// commas. The empty label set maps to the empty string.
pub fn label_key(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    out
}
