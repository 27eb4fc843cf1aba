//! Outbound request executor.
//!
//! Wraps a pooled `reqwest::Client` with per-upstream default headers and
//! proxy settings, classifies failures into [`AppError`] and retries
//! transport-level errors with a fixed-delay policy. HTTP error statuses are
//! never retried; they surface as `UpstreamApi` errors carrying the
//! upstream's raw body.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response};

use crate::error::AppError;
use crate::metrics::Metrics;

/// Fixed-attempt, fixed-delay retry. No backoff; the upstreams this gateway
/// talks to either recover within milliseconds or not at all.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Retries `f` while `should_retry` approves the error, sleeping `delay`
/// between strictly sequential attempts. The final error is returned as-is.
pub async fn retry_async<T, E, Fut>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut f: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.retries.max(1) || !should_retry(&error) {
                    return Err(error);
                }
                tracing::debug!(attempt, retries = policy.retries, "retrying after transport error");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// One long-lived client per upstream, constructed at startup and shared by
/// every task. Connection pooling and TLS live in the inner `reqwest::Client`.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    metrics: Metrics,
}

impl HttpClient {
    pub fn new(
        default_headers: HeaderMap,
        proxy: Option<&str>,
        timeout: Duration,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .default_headers(default_headers)
            .cookie_store(true)
            .timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy URL")?);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self { client, metrics })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Single attempt, classified.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        self.try_send(request).await.map_err(transport_error)
    }

    /// Transport errors are retried per `policy`; requests with a
    /// non-replayable (streaming) body get exactly one attempt.
    pub async fn send_retrying(
        &self,
        request: RequestBuilder,
        policy: &RetryPolicy,
    ) -> Result<Response, AppError> {
        if request.try_clone().is_none() {
            return self.send(request).await;
        }
        retry_async(policy, is_transport_error, || {
            let attempt = request.try_clone().expect("request body is replayable");
            self.try_send(attempt)
        })
        .await
        .map_err(transport_error)
    }

    async fn try_send(&self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        let request = request.build()?;
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(%method, %url, "request sent");
        self.metrics.record_upstream_request();
        let started = Instant::now();
        let result = self.client.execute(request).await;
        let elapsed = started.elapsed();
        self.metrics.record_upstream_latency(elapsed.as_secs_f64());
        match &result {
            Ok(response) => tracing::debug!(
                %method,
                %url,
                status = response.status().as_u16(),
                length = response.content_length().unwrap_or(0),
                elapsed_ms = elapsed.as_millis() as u64,
                "request finished"
            ),
            Err(error) => {
                self.metrics.record_upstream_failure();
                tracing::debug!(%method, %url, %error, "request errored");
            }
        }
        result
    }
}

fn is_transport_error(error: &reqwest::Error) -> bool {
    error.status().is_none()
}

fn transport_error(_: reqwest::Error) -> AppError {
    // Transport failures carry no upstream body; the envelope falls back to
    // the generic detail.
    AppError::upstream(String::new())
}

/// Turns a client/server error status into an `UpstreamApi` error with the
/// raw response body as detail.
pub async fn ensure_success(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let detail = response.text().await.unwrap_or_default();
        return Err(AppError::upstream(detail));
    }
    Ok(response)
}

pub async fn read_text(response: Response) -> Result<String, AppError> {
    response
        .text()
        .await
        .map_err(|_| AppError::upstream(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_on_the_third_attempt() {
        let mut calls = 0u32;
        let result = retry_async(&fast_policy(3), |_: &&str| true, || {
            calls += 1;
            let outcome: Result<u32, &str> = if calls < 3 { Err("reset") } else { Ok(42) };
            async move { outcome }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_the_final_error() {
        let mut calls = 0u32;
        let result: Result<u32, &str> = retry_async(&fast_policy(3), |_: &&str| true, || {
            calls += 1;
            async { Err("reset") }
        })
        .await;
        assert_eq!(result, Err("reset"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let mut calls = 0u32;
        let result: Result<u32, &str> = retry_async(&fast_policy(3), |_: &&str| false, || {
            calls += 1;
            async { Err("status 500") }
        })
        .await;
        assert_eq!(result, Err("status 500"));
        assert_eq!(calls, 1);
    }
}
