//! Per-alias reverse proxy listener
//!
//! One axum server per running alias. The listener is bound before the value
//! is returned, so a successful [`ReverseProxyServer::bind`] means the port is
//! taken and serving.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ProxyError;
use crate::proxy::forward;
use crate::proxy::upstream::UpstreamClient;
use crate::registry::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Binding,
    Listening,
    Draining,
    Closed,
}

/// State shared by the handlers of one listener.
#[derive(Clone)]
struct AppState {
    model: Arc<Model>,
    client: UpstreamClient,
}

pub struct ReverseProxyServer {
    alias: String,
    addr: SocketAddr,
    state: Arc<watch::Sender<ListenerState>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReverseProxyServer {
    /// Bind `host:port` and start serving `model`.
    ///
    /// The bind error is returned untouched so callers can tell `AddrInUse`
    /// apart from other failures.
    pub async fn bind(
        host: &str,
        port: u16,
        model: Model,
        client: UpstreamClient,
        max_body_bytes: usize,
    ) -> std::io::Result<Self> {
        let (state_tx, _) = watch::channel(ListenerState::Unbound);
        let state = Arc::new(state_tx);

        state.send_replace(ListenerState::Binding);
        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                state.send_replace(ListenerState::Closed);
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;

        let alias = model.alias.clone();
        let target = model.url.clone();
        let app = build_app(
            AppState {
                model: Arc::new(model),
                client,
            },
            max_body_bytes,
        );

        state.send_replace(ListenerState::Listening);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_state = state.clone();
        let task_alias = alias.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(alias = %task_alias, "Proxy server failed: {}", e);
            }
            task_state.send_replace(ListenerState::Closed);
            tracing::info!(alias = %task_alias, "Proxy server stopped");
        });

        tracing::info!(alias = %alias, addr = %addr, target = %target, "Proxy server listening");

        Ok(Self {
            alias,
            addr,
            state,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Stop accepting, wait up to `drain_timeout` for in-flight requests, then
    /// force the server task down. The port is free once this returns.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        self.state.send_replace(ListenerState::Draining);
        tracing::info!(alias = %self.alias, port = self.addr.port(), "Draining proxy server");

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(drain_timeout, &mut task).await.is_err() {
                tracing::warn!(
                    alias = %self.alias,
                    "In-flight requests still open after {:?}, closing listener",
                    drain_timeout
                );
                task.abort();
                let _ = task.await;
            }
        }

        self.state.send_replace(ListenerState::Closed);
    }
}

impl Drop for ReverseProxyServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn build_app(state: AppState, max_body_bytes: usize) -> Router {
    // Answers every OPTIONS as a preflight and stamps `*` on all responses,
    // error envelopes included.
    let cors = CorsLayer::new()
        .allow_origin(cors::Any)
        .allow_methods(cors::Any)
        .allow_headers(cors::Any);

    Router::new()
        .route("/health", get(health_check_handler))
        .route("/v1/*path", any(proxy_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Forward everything under `/v1` to `model.url`, keeping the rest of the path.
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ProxyError::Validation(format!(
                "failed to read request body: {}",
                rejection.body_text()
            ))
            .into_response()
        }
    };

    let suffix = uri.path().strip_prefix("/v1").unwrap_or(uri.path());
    forward::forward(
        &state.client,
        &state.model,
        method,
        suffix,
        uri.query(),
        &headers,
        body,
    )
    .await
}

async fn health_check_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "ok", "alias": state.model.alias})),
    )
        .into_response()
}

async fn not_found_handler(uri: Uri) -> Response {
    ProxyError::NotFound(uri.path().to_string()).into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    tracing::error!("Request handler panicked: {}", details);
    ProxyError::Unknown {
        message: "internal proxy error".to_string(),
        details: Some(details),
    }
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_becomes_unknown_error() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let client = UpstreamClient::new(&Default::default()).unwrap();
        let model = Model {
            id: "id".into(),
            alias: "a".into(),
            url: "http://127.0.0.1:9".into(),
            real_model: "m".into(),
            is_default: false,
        };

        let err = ReverseProxyServer::bind("127.0.0.1", port, model, client, 1024)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let client = UpstreamClient::new(&Default::default()).unwrap();
        let model = Model {
            id: "id".into(),
            alias: "a".into(),
            url: "http://127.0.0.1:9".into(),
            real_model: "m".into(),
            is_default: false,
        };

        let server = ReverseProxyServer::bind("127.0.0.1", 0, model, client, 1024)
            .await
            .unwrap();
        assert_eq!(server.state(), ListenerState::Listening);
        let mut states = server.subscribe();
        let port = server.port();

        server.shutdown(Duration::from_secs(1)).await;
        assert_eq!(*states.borrow_and_update(), ListenerState::Closed);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
