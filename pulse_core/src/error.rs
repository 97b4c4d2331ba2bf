use crate::snapshot::MetricKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("invalid metric name {0:?}")]
    InvalidMetricName(String),

    #[error("invalid label name {0:?}")]
    InvalidLabelName(String),

    #[error("metric {name:?} already registered as {existing}")]
    AlreadyRegistered { name: String, existing: MetricKind },

    #[error("expected {expected} label values, got {got}")]
    LabelCardinality { expected: usize, got: usize },

    #[error("label {0:?} is not declared on this vector")]
    UnknownLabel(String),
}

pub type Result<T> = std::result::Result<T, MetricError>;
