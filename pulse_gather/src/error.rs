use crate::hub::CollectorId;
use pulse_core::MetricError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatherError {
    #[error("collector {id} failed: {source}")]
    Collector {
        id: CollectorId,
        #[source]
        source: anyhow::Error,
    },

    #[error("metric gathering exceeded its deadline")]
    DeadlineExceeded,

    #[error("namespace {0:?} is already registered")]
    DuplicateNamespace(String),

    #[error("family {0:?} is already provided by another collector")]
    DuplicateFamily(String),

    #[error("gathering namespace {namespace:?}: {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: Box<GatherError>,
    },

    #[error(transparent)]
    Validation(#[from] MetricError),
}

pub type Result<T> = std::result::Result<T, GatherError>;
