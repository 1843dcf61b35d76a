//! HTTP proxy logic
//!
//! Requests to `/{class}/{path}` are forwarded to the upstream configured for
//! `class` with a key from the pool injected. Quota and auth failures rotate to
//! the next key via `call_with_rotation`; anything else is relayed verbatim.

use crate::error::AttemptError;
use crate::metrics;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use key_pool::{ApiKey, KeyPool, RetryPolicy, RotationError, call_with_rotation};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum inbound request body size.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Where and how to send one credential class's requests.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub url: String,
    pub key_header: HeaderName,
    pub key_prefix: String,
}

impl Upstream {
    /// Header value carrying `key`, marked sensitive so it is never logged.
    fn key_value(&self, key: &ApiKey) -> Result<HeaderValue, AttemptError> {
        let mut value = HeaderValue::from_str(&format!("{}{}", self.key_prefix, key.expose()))
            .map_err(|e| AttemptError::InvalidKey(e.to_string()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Fully buffered upstream response.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamReply {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn into_response(self) -> Response {
        let mut response = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            if !is_hop_by_hop(name.as_str()) {
                response = response.header(name, value);
            }
        }
        response
            .body(axum::body::Body::from(self.body))
            .unwrap_or_else(|e| {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("response build error: {e}"),
                    "",
                )
            })
    }
}

/// HTTP client for upstream calls.
///
/// Redirects are never followed: a provider's `Location` could name another
/// origin, and only `authorization` is dropped on cross-origin hops while the
/// key may travel in any header. 3xx responses are relayed to the caller.
pub fn upstream_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub pool: Arc<KeyPool>,
    pub upstreams: Arc<HashMap<String, Upstream>>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_body(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    error_body(status, "proxy_error", message, request_id)
}

/// Split `/google/v1beta/models` into `("google", "v1beta/models")`.
pub fn split_class(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.split_once('/').unwrap_or((trimmed, "")))
}

/// Proxy an inbound request to its class's upstream, rotating keys on
/// quota and auth failures.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();

    let Some((class, rest)) = split_class(uri.path()) else {
        return fail(state, StatusCode::NOT_FOUND, "no credential class in path", &request_id);
    };
    let class = class.to_ascii_lowercase();

    let Some(upstream) = state.upstreams.get(&class) else {
        return fail(
            state,
            StatusCode::NOT_FOUND,
            &format!("unknown credential class: {class}"),
            &request_id,
        );
    };

    let mut target = format!("{}/{}", upstream.url.trim_end_matches('/'), rest);
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    // Client credentials never reach upstream; the pool supplies the key
    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if is_hop_by_hop(name.as_str())
            || *name == axum::http::header::HOST
            || *name == axum::http::header::CONTENT_LENGTH
            || *name == axum::http::header::AUTHORIZATION
            || *name == upstream.key_header
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return fail(
                state,
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let outcome = call_with_rotation(
        &state.pool,
        &class,
        state.retry,
        &AttemptError::classification,
        |key| {
            let key_value = upstream.key_value(&key);
            let mut headers = headers.clone();
            let request = state
                .client
                .request(method.clone(), &target)
                .timeout(state.timeout)
                .body(body_bytes.clone());
            async move {
                headers.insert(upstream.key_header.clone(), key_value?);
                send(request.headers(headers)).await
            }
        },
    )
    .await;

    let response = match outcome {
        Ok(reply) => reply.into_response(),
        Err(RotationError::Fatal(AttemptError::Upstream(reply))) => {
            // Not a key problem: the client sees exactly what upstream said
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(&class, "upstream_status");
            warn!(class = %class, status = reply.status.as_u16(), "upstream error relayed");
            reply.into_response()
        }
        Err(RotationError::Fatal(AttemptError::Transport(e))) if e.is_timeout() => {
            metrics::record_upstream_error(&class, "timeout");
            error!(class = %class, error = %e, "upstream timeout");
            fail(
                state,
                StatusCode::GATEWAY_TIMEOUT,
                &format!("upstream timeout after {}s", state.timeout.as_secs()),
                &request_id,
            )
        }
        Err(RotationError::Fatal(AttemptError::Transport(e))) => {
            metrics::record_upstream_error(&class, "connection");
            error!(class = %class, error = %e, "upstream request failed");
            fail(
                state,
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {e}"),
                &request_id,
            )
        }
        Err(RotationError::Fatal(e @ AttemptError::InvalidKey(_))) => {
            error!(class = %class, error = %e, "unusable key");
            fail(state, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), &request_id)
        }
        Err(err @ RotationError::ExhaustedAllKeys { .. }) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(&class, "keys_exhausted");
            warn!(class = %class, error = %err, "serving degraded response");
            error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "keys_exhausted",
                err.user_message().unwrap_or(key_pool::DEGRADED_MESSAGE),
                &request_id,
            )
        }
    };

    let status = response.status().as_u16();
    metrics::record_request(status, &class, started.elapsed().as_secs_f64());
    info!(class = %class, status, "request completed");
    response
}

/// Send one attempt and buffer the response. 4xx/5xx become `AttemptError::Upstream`.
async fn send(request: reqwest::RequestBuilder) -> Result<UpstreamReply, AttemptError> {
    let response = request.send().await.map_err(AttemptError::Transport)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(AttemptError::Transport)?;

    let reply = UpstreamReply {
        status,
        headers,
        body,
    };
    if status.is_client_error() || status.is_server_error() {
        Err(AttemptError::Upstream(reply))
    } else {
        Ok(reply)
    }
}

/// Count the error and build a proxy error response.
fn fail(state: &ProxyState, status: StatusCode, message: &str, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    error_response(status, message, request_id)
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Goog-Api-Key"));
    }

    #[test]
    fn test_split_class() {
        assert_eq!(
            split_class("/google/v1beta/models/gemini:generateContent"),
            Some(("google", "v1beta/models/gemini:generateContent"))
        );
        assert_eq!(split_class("/anam"), Some(("anam", "")));
        assert_eq!(split_class("/anam/"), Some(("anam", "")));
        assert_eq!(split_class("/"), None);
        assert_eq!(split_class(""), None);
    }

    #[test]
    fn test_key_value_applies_prefix_and_is_sensitive() {
        let upstream = Upstream {
            url: "https://api.anam.ai".into(),
            key_header: HeaderName::from_static("authorization"),
            key_prefix: "Bearer ".into(),
        };
        let value = upstream.key_value(&ApiKey::from("sk-123")).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer sk-123");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_key_value_rejects_control_characters() {
        let upstream = Upstream {
            url: "https://api.anam.ai".into(),
            key_header: HeaderName::from_static("x-api-key"),
            key_prefix: String::new(),
        };
        let err = upstream.key_value(&ApiKey::from("bad\nkey")).unwrap_err();
        assert!(matches!(err, AttemptError::InvalidKey(_)));
    }

    #[test]
    fn test_error_response_format() {
        let resp = error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream timeout after 60s",
            "req_abc123",
        );
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
