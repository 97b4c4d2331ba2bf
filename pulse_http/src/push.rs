//! Best-effort push: gather once, encode, POST to a remote endpoint. No
//! retries and no remote-write protocol; a failed push is just an error.

use pulse_gather::{CancellationToken, Gatherer};
use pulse_text::encode_to_string;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("invalid push URL {0:?}")]
    InvalidUrl(String),

    #[error(transparent)]
    Gather(#[from] pulse_gather::GatherError),

    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("push endpoint answered status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOpts {
    /// Base URL of the push endpoint; `/metrics/job/<job>` is appended.
    pub url: String,
    pub job: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// Gathers from `gatherer` and pushes the encoded snapshot.
pub async fn push(gatherer: &dyn Gatherer, opts: &PushOpts) -> Result<(), PushError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = opts.timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build()?;
    push_with_client(gatherer, opts, &client).await
}

/// Like [`push`] but reuses the caller's HTTP client.
pub async fn push_with_client(
    gatherer: &dyn Gatherer,
    opts: &PushOpts,
    client: &reqwest::Client,
) -> Result<(), PushError> {
    let url = compose_url(opts)?;

    let families = gatherer
        .gather(CancellationToken::new())
        .await
        .into_result()?;
    let body = encode_to_string(&families);

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PushError::Status(status.as_u16()));
    }
    Ok(())
}

fn compose_url(opts: &PushOpts) -> Result<Url, PushError> {
    let mut url =
        Url::parse(&opts.url).map_err(|_| PushError::InvalidUrl(opts.url.clone()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| PushError::InvalidUrl(opts.url.clone()))?;
        segments.pop_if_empty();
        if !opts.job.is_empty() {
            segments.extend(["metrics", "job", opts.job.as_str()]);
        }
        if let Some(instance) = &opts.instance {
            segments.extend(["instance", instance.as_str()]);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use pulse_core::Registry;
    use std::net::SocketAddr;

    fn job_registry() -> Registry {
        let registry = Registry::new();
        registry.counter("jobs_total", "Jobs run").unwrap().inc();
        registry
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn urls_compose_with_job_and_instance() {
        let opts = PushOpts {
            url: "http://push.example:9091/".to_string(),
            job: "nightly batch".to_string(),
            instance: Some("worker/1".to_string()),
            timeout: None,
        };
        let url = compose_url(&opts).unwrap();
        assert_eq!(
            url.as_str(),
            "http://push.example:9091/metrics/job/nightly%20batch/instance/worker%2F1"
        );
    }

    #[tokio::test]
    async fn pushes_the_encoded_snapshot() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, String)>(1);
        let app = Router::new().route(
            "/metrics/job/:job",
            post(move |Path(job): Path<String>, body: String| {
                let tx = tx.clone();
                async move {
                    tx.send((job, body)).await.unwrap();
                    StatusCode::OK
                }
            }),
        );
        let addr = serve(app).await;

        let registry = job_registry();
        let opts = PushOpts {
            url: format!("http://{addr}"),
            job: "batch".to_string(),
            instance: None,
            timeout: Some(Duration::from_secs(5)),
        };
        push(&registry, &opts).await.unwrap();

        let (job, body) = rx.recv().await.unwrap();
        assert_eq!(job, "batch");
        assert!(body.contains("jobs_total 1"));
        assert!(body.contains("# TYPE jobs_total counter"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let app = Router::new().route(
            "/metrics/job/:job",
            post(|| async { StatusCode::BAD_REQUEST }),
        );
        let addr = serve(app).await;

        let opts = PushOpts {
            url: format!("http://{addr}"),
            job: "batch".to_string(),
            instance: None,
            timeout: Some(Duration::from_secs(5)),
        };
        let err = push(&job_registry(), &opts).await.unwrap_err();
        assert!(matches!(err, PushError::Status(400)));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let opts = PushOpts {
            url: "not a url".to_string(),
            job: "batch".to_string(),
            instance: None,
            timeout: None,
        };
        assert!(matches!(
            compose_url(&opts),
            Err(PushError::InvalidUrl(_))
        ));
    }
}
