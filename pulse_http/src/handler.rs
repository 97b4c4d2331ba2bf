use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use pulse_core::{
    CounterVec, Gauge, Histogram, Labels, Metric, MetricFamily, MetricKind, MetricValue, Registry,
};
use pulse_gather::{CancellationToken, DynGatherer, GatherOutcome};
use pulse_text::encode_to_string;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Inbound header carrying the scraper's timeout budget in seconds.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// What to do when gathering fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Answer 503 on timeout, 500 on a hard gather failure.
    HttpError,
    /// Serve whatever was gathered plus a synthetic error metric carrying
    /// the message.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOpts {
    /// Upper bound on one gather. The effective per-request deadline is the
    /// smaller of this and the scrape-timeout header.
    pub timeout: Option<Duration>,
    /// Concurrency gate: requests beyond the bound get an immediate 503,
    /// never queued. `None` means unbounded.
    pub max_in_flight: Option<usize>,
    pub error_policy: ErrorPolicy,
    /// Whether to answer OpenMetrics when the Accept header asks for it.
    pub open_metrics: bool,
}

impl Default for HandlerOpts {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            max_in_flight: None,
            error_policy: ErrorPolicy::HttpError,
            open_metrics: true,
        }
    }
}

/// Serves gathered metrics over HTTP.
pub struct ScrapeHandler {
    gatherer: DynGatherer,
    opts: HandlerOpts,
    gate: Option<Arc<Semaphore>>,
    instruments: Option<Instruments>,
}

/// Self-instrumentation of the scrape endpoint.
struct Instruments {
    in_flight: Gauge,
    requests: CounterVec,
    duration: Histogram,
}

impl ScrapeHandler {
    pub fn new(gatherer: DynGatherer, opts: HandlerOpts) -> Arc<Self> {
        let gate = opts.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        Arc::new(Self {
            gatherer,
            opts,
            gate,
            instruments: None,
        })
    }

    /// Like [`ScrapeHandler::new`], additionally recording scrape counts,
    /// in-flight scrapes, and scrape latency into `registry`.
    pub fn instrumented(
        gatherer: DynGatherer,
        opts: HandlerOpts,
        registry: &Registry,
    ) -> pulse_core::Result<Arc<Self>> {
        let instruments = Instruments {
            in_flight: registry.gauge(
                "scrapes_in_flight",
                "Current number of scrapes being served.",
            )?,
            requests: registry.counter_vec(
                "scrape_requests_total",
                "Total number of scrapes by HTTP status code.",
                &["code"],
            )?,
            duration: registry.histogram(
                "scrape_duration_seconds",
                "Histogram of scrape latencies.",
                &[],
            )?,
        };
        let gate = opts.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        Ok(Arc::new(Self {
            gatherer,
            opts,
            gate,
            instruments: Some(instruments),
        }))
    }

    /// A router serving GET `/metrics`. Other methods answer 405.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().route("/metrics", self.method_router())
    }

    /// The GET route alone, for mounting at a custom path.
    pub fn method_router(self: &Arc<Self>) -> MethodRouter {
        get(serve).with_state(self.clone())
    }

    pub async fn handle(&self, headers: &HeaderMap) -> Response {
        let timer = self.instruments.as_ref().map(|instruments| {
            instruments.in_flight.inc();
            instruments.duration.start_timer()
        });
        let response = self.respond(headers).await;
        if let Some(instruments) = &self.instruments {
            instruments.in_flight.dec();
            if let Ok(by_code) = instruments
                .requests
                .with_label_values(&[response.status().as_str()])
            {
                by_code.inc();
            }
        }
        drop(timer);
        response
    }

    async fn respond(&self, headers: &HeaderMap) -> Response {
        let _permit = match &self.gate {
            Some(gate) => match gate.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return plain(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "too many concurrent scrapes",
                    );
                }
            },
            None => None,
        };

        let timeout = effective_timeout(self.opts.timeout, header_timeout(headers));
        let cancel = CancellationToken::new();
        let timer = timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        });
        let report = self.gatherer.gather(cancel).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let families = match report.outcome {
            GatherOutcome::Complete => report.families,
            GatherOutcome::TimedOut => {
                warn!("metric gathering timed out");
                match self.opts.error_policy {
                    ErrorPolicy::HttpError => {
                        return plain(StatusCode::SERVICE_UNAVAILABLE, "metric gathering timed out");
                    }
                    ErrorPolicy::Continue => {
                        with_error_family(report.families, "metric gathering timed out")
                    }
                }
            }
            GatherOutcome::Errored(error) => {
                warn!(%error, "metric gathering failed");
                match self.opts.error_policy {
                    ErrorPolicy::HttpError => {
                        return plain(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("gathering metrics failed: {error}"),
                        );
                    }
                    ErrorPolicy::Continue => {
                        with_error_family(report.families, &error.to_string())
                    }
                }
            }
        };

        let content_type = negotiate_content_type(headers, self.opts.open_metrics);
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            encode_to_string(&families),
        )
            .into_response()
    }
}

async fn serve(State(handler): State<Arc<ScrapeHandler>>, headers: HeaderMap) -> Response {
    handler.handle(&headers).await
}

fn plain(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

fn header_timeout(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(SCRAPE_TIMEOUT_HEADER)?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

fn effective_timeout(configured: Option<Duration>, header: Option<Duration>) -> Option<Duration> {
    match (configured, header) {
        (Some(configured), Some(header)) => Some(configured.min(header)),
        (configured, None) => configured,
        (None, header) => header,
    }
}

fn negotiate_content_type(headers: &HeaderMap, open_metrics: bool) -> &'static str {
    if open_metrics {
        if let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
            if accept.contains("application/openmetrics-text") {
                return OPENMETRICS_CONTENT_TYPE;
            }
        }
    }
    TEXT_CONTENT_TYPE
}

fn with_error_family(mut families: Vec<MetricFamily>, message: &str) -> Vec<MetricFamily> {
    let mut labels = Labels::new();
    labels.insert("error".to_string(), message.to_string());
    families.push(MetricFamily {
        name: "pulse_gathering_error".to_string(),
        help: "Error encountered while gathering metrics.".to_string(),
        kind: MetricKind::Gauge,
        metrics: vec![Metric {
            labels,
            value: MetricValue::Scalar(1.0),
        }],
    });
    families
}
