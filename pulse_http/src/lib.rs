//! HTTP surface: a GET-only scrape endpoint with timeout/overload
//! semantics, and a best-effort push client.

pub mod handler;
pub mod push;

pub use handler::{
    ErrorPolicy, HandlerOpts, ScrapeHandler, OPENMETRICS_CONTENT_TYPE, SCRAPE_TIMEOUT_HEADER,
    TEXT_CONTENT_TYPE,
};
pub use push::{push, push_with_client, PushError, PushOpts};
