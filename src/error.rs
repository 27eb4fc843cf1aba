use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{detail}")]
    ClientSide { code: u16, detail: String },
    #[error("rate limit reached")]
    RateLimited,
    #[error("upstream API request failed")]
    UpstreamApi { detail: String },
    #[error("uncaught exception raised during processing")]
    Uncaught(#[from] anyhow::Error),
}

impl AppError {
    pub fn bad_request<T: Into<String>>(detail: T) -> Self {
        Self::ClientSide {
            code: 400,
            detail: detail.into(),
        }
    }

    pub fn client_side<T: Into<String>>(code: u16, detail: T) -> Self {
        debug_assert!((400..500).contains(&code));
        Self::ClientSide {
            code,
            detail: detail.into(),
        }
    }

    pub fn validation<T: Into<String>>(detail: T) -> Self {
        Self::client_side(422, detail)
    }

    /// Any failure talking to an upstream; `detail` carries the upstream's
    /// raw error body when one was received.
    pub fn upstream(detail: String) -> Self {
        Self::UpstreamApi { detail }
    }

    pub fn code(&self) -> u16 {
        match self {
            AppError::ClientSide { code, .. } => *code,
            AppError::RateLimited => 429,
            AppError::UpstreamApi { .. } => 502,
            AppError::Uncaught(_) => 500,
        }
    }
}

/// The standard error body every failed request renders to:
/// `{url, time, code, detail, headers, trace?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub url: Option<String>,
    pub time: DateTime<Utc>,
    pub code: u16,
    pub detail: String,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Full error chain, persisted to disk for 5xx failures; never serialized.
    #[serde(skip)]
    pub backtrace: Option<String>,
}

impl ErrorEnvelope {
    fn from_error(error: &AppError) -> Self {
        let detail = match error {
            AppError::UpstreamApi { detail } if !detail.trim().is_empty() => detail.clone(),
            other => other.to_string(),
        };
        let mut headers = HashMap::new();
        if matches!(error, AppError::RateLimited) {
            headers.insert("Retry-After".to_string(), "60".to_string());
        }
        let backtrace = match error {
            AppError::Uncaught(inner) => Some(format!("{inner:?}")),
            _ => None,
        };
        Self {
            url: None,
            time: Utc::now(),
            code: error.code(),
            detail,
            headers,
            trace: None,
            backtrace,
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn render(&self) -> Response {
        let mut response = (self.status(), Json(self)).into_response();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), HeaderValue::from_str(value))
            {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::from_error(&self);
        if envelope.code >= 500 {
            tracing::error!(code = envelope.code, detail = %envelope.detail, "request failed");
        }
        let mut response = envelope.render();
        // The outermost middleware picks this up to fill in the request URL
        // and persist a trace for 5xx failures.
        response.extensions_mut().insert(envelope);
        response
    }
}

/// Outermost layer: rewrites pending error envelopes with the request URL
/// and, for 5xx-class failures, a persisted trace id.
pub async fn error_envelope(
    State(trace_dir): State<PathBuf>,
    request: Request,
    next: Next,
) -> Response {
    let url = request.uri().to_string();
    let mut response = next.run(request).await;
    let Some(mut envelope) = response.extensions_mut().remove::<ErrorEnvelope>() else {
        return response;
    };
    envelope.url = Some(url);
    if envelope.code >= 500 {
        match persist_trace(&trace_dir, &envelope).await {
            Ok(id) => envelope.trace = Some(id),
            Err(error) => tracing::warn!(%error, "failed to persist error trace"),
        }
    }
    envelope.render()
}

async fn persist_trace(dir: &Path, envelope: &ErrorEnvelope) -> anyhow::Result<String> {
    let id = format!("{:016x}", rand::random::<u64>());
    tokio::fs::create_dir_all(dir).await?;
    let body = format!(
        "{}\n{} {}\n\n{}\n",
        envelope.time,
        envelope.code,
        envelope.detail,
        envelope
            .backtrace
            .as_deref()
            .unwrap_or("<no backtrace captured>"),
    );
    tokio::fs::write(dir.join(format!("{id}.txt")), body).await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(AppError::bad_request("nope").code(), 400);
        assert_eq!(AppError::validation("nope").code(), 422);
        assert_eq!(AppError::RateLimited.code(), 429);
        assert_eq!(AppError::upstream("boom".into()).code(), 502);
        assert_eq!(AppError::Uncaught(anyhow::anyhow!("boom")).code(), 500);
    }

    #[test]
    fn upstream_body_becomes_the_detail() {
        let envelope =
            ErrorEnvelope::from_error(&AppError::upstream(r#"{"code":-404}"#.to_string()));
        assert_eq!(envelope.code, 502);
        assert_eq!(envelope.detail, r#"{"code":-404}"#);
    }

    #[test]
    fn envelope_serializes_without_empty_trace() {
        let envelope = ErrorEnvelope::from_error(&AppError::bad_request("missing key"));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["code"], 400);
        assert_eq!(value["detail"], "missing key");
        assert!(value.get("trace").is_none());
        assert!(value.as_object().unwrap().contains_key("url"));
    }

    #[test]
    fn uncaught_errors_capture_their_chain() {
        let root = anyhow::anyhow!("connection reset").context("refreshing token");
        let envelope = ErrorEnvelope::from_error(&AppError::Uncaught(root));
        let backtrace = envelope.backtrace.unwrap();
        assert!(backtrace.contains("refreshing token"));
        assert!(backtrace.contains("connection reset"));
    }
}
