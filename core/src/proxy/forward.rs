//! Request forwarding to an alias's backend with streaming support.
//!
//! Every call to [`forward`] returns exactly one response: either the relayed
//! upstream response or a [`ProxyError`] envelope.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::ProxyError;
use crate::proxy::upstream::UpstreamClient;
use crate::registry::Model;

/// Request headers never copied to the backend.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "accept-encoding",
    // hop-by-hop
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers the outbound transport recomputes.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "keep-alive",
];

fn should_forward_request_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !STRIPPED_REQUEST_HEADERS.contains(&lower.as_str())
}

fn should_relay_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str())
}

/// Copy the caller's headers minus the ones the proxy must not forward.
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if should_forward_request_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        if should_relay_response_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// `base_url + suffix (+ ?query)`, refusing anything that is not an absolute http(s) URL.
pub fn build_target(base_url: &str, suffix: &str, query: Option<&str>) -> Result<Url, ProxyError> {
    let mut target = format!("{}{}", base_url, suffix);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(q);
    }

    let url = Url::parse(&target).map_err(|e| ProxyError::InvalidTarget {
        target: target.clone(),
        details: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget {
            details: format!("unsupported scheme '{}'", url.scheme()),
            target,
        });
    }

    Ok(url)
}

/// A request body after the model substitution.
#[derive(Debug)]
pub struct RewrittenBody {
    pub bytes: Bytes,
    /// Caller asked for `stream: true`.
    pub stream: bool,
}

/// Parse the caller's JSON object and overwrite its `model` key with `real_model`.
///
/// Every other field passes through untouched. An empty body counts as `{}`.
pub fn rewrite_body(body: &[u8], real_model: &str) -> Result<RewrittenBody, ProxyError> {
    let mut doc: Value = if is_blank(body) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ProxyError::Validation(format!("request body is not valid JSON: {}", e)))?
    };

    let object = doc
        .as_object_mut()
        .ok_or_else(|| ProxyError::Validation("request body must be a JSON object".to_string()))?;

    object.insert("model".to_string(), Value::String(real_model.to_string()));
    let stream = object.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let bytes = serde_json::to_vec(&doc)
        .map_err(|e| ProxyError::unknown(format!("failed to encode request body: {}", e)))?;

    Ok(RewrittenBody {
        bytes: Bytes::from(bytes),
        stream,
    })
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// POST/PUT/PATCH always send a (possibly empty, then `{}`) JSON body; other
/// methods send one only when the caller supplied it, e.g. a DELETE with a payload.
fn carries_body(method: &Method, body: &[u8]) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH) || !is_blank(body)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

/// Connect/DNS failures are 502, anything else during dispatch is 500.
fn classify_dispatch_error(err: &reqwest::Error) -> ProxyError {
    let chain = error_chain(err);
    if err.is_connect() {
        ProxyError::Connection(chain)
    } else {
        ProxyError::Unknown {
            message: "upstream request failed".to_string(),
            details: Some(chain),
        }
    }
}

/// Forward one caller request to `model.url + suffix`.
pub async fn forward(
    client: &UpstreamClient,
    model: &Model,
    method: Method,
    suffix: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    match try_forward(client, model, method, suffix, query, headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn try_forward(
    client: &UpstreamClient,
    model: &Model,
    method: Method,
    suffix: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let target = build_target(&model.url, suffix, query)?;
    let mut outbound_headers = sanitize_request_headers(headers);

    let (outbound_body, wants_stream) = if carries_body(&method, &body) {
        let rewritten = rewrite_body(&body, &model.real_model)?;
        outbound_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        (Some(rewritten.bytes), rewritten.stream)
    } else {
        (None, false)
    };

    debug!(
        alias = %model.alias,
        method = %method,
        target = %target,
        real_model = %model.real_model,
        stream = wants_stream,
        "Forwarding request"
    );

    let response = client
        .send(method, target.clone(), outbound_headers, outbound_body)
        .await
        .map_err(|e| {
            let err = classify_dispatch_error(&e);
            error!(alias = %model.alias, target = %target, kind = err.kind(), "Upstream request failed: {}", e);
            err
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(backend_error(&model.alias, response).await);
    }

    if wants_stream || is_event_stream(response.headers()) {
        Ok(stream_response(response))
    } else {
        buffered_response(response).await
    }
}

/// Non-2xx upstream: keep its status, wrap its raw body.
async fn backend_error(alias: &str, response: reqwest::Response) -> ProxyError {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            debug!("Failed to read upstream error body: {}", e);
            String::new()
        }
    };

    warn!(alias = %alias, status = %status.as_u16(), "Upstream returned error: {}", body);
    ProxyError::Backend {
        status,
        reason,
        body,
    }
}

/// Relay each upstream chunk as it arrives; the caller's body ends when the upstream's does.
fn stream_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let mut headers = relay_headers(response.headers());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );

    let chunks = response.bytes_stream().map_err(std::io::Error::other);

    let mut relayed = Response::new(Body::from_stream(chunks));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

async fn buffered_response(response: reqwest::Response) -> Result<Response, ProxyError> {
    let status = response.status();
    let mut headers = relay_headers(response.headers());
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    let bytes = response.bytes().await.map_err(|e| {
        error!("Failed to read upstream response: {}", e);
        ProxyError::Connection(error_chain(&e))
    })?;

    let mut relayed = Response::new(Body::from(bytes));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    Ok(relayed)
}
