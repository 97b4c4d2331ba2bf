//! Deadline-aware gathering: collectors contribute metric families, a hub
//! fans them out with panic isolation, and composite gatherers merge
//! namespaced sources into one snapshot.

pub mod collector;
pub mod error;
pub mod hub;
pub mod multi;
pub mod process;

pub use collector::{Collector, CollectorFn, DynCollector, FamilyDesc};
pub use error::{GatherError, Result};
pub use hub::{CollectorHub, CollectorId, GatherOutcome, GatherReport};
pub use multi::{DynGatherer, Gatherer, MultiGatherer};
pub use process::ProcessCollector;

// Re-export commonly used types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
