//! Error taxonomy shared by the registry, the router and the per-request proxy path.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failures of the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),

    #[error("model with alias '{0}' already exists")]
    Conflict(String),

    #[error("model with ID '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Conflict(_) => "ConflictError",
            Self::NotFound(_) => "NotFoundError",
            Self::Store(_) => "StorageError",
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no model registered with alias '{0}'")]
    ModelNotFound(String),

    #[error("proxy for '{0}' is already running")]
    AlreadyRunning(String),

    #[error("proxy for '{0}' is not running")]
    NotRunning(String),

    #[error("no free port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "ModelNotFound",
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::NotRunning(_) => "NotRunning",
            Self::NoFreePort { .. } => "NoFreePort",
            Self::Bind { .. } => "BindError",
            Self::Client(_) => "ClientError",
            Self::Registry(e) => e.kind(),
        }
    }
}

/// Errors surfaced by the control surface in [`crate::manager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

impl ManagerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.kind(),
            Self::Router(e) => e.kind(),
        }
    }
}

/// Per-request failure on a running proxy. Each variant renders as exactly one
/// JSON error envelope.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid target URL '{target}'")]
    InvalidTarget { target: String, details: String },

    #[error("failed to reach upstream: {0}")]
    Connection(String),

    #[error("upstream responded with {} {}", .status.as_u16(), .reason)]
    Backend {
        status: StatusCode,
        reason: String,
        body: String,
    },

    #[error("{message}")]
    Unknown {
        message: String,
        details: Option<String>,
    },

    #[error("no route for {0}")]
    NotFound(String),
}

impl ProxyError {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            details: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidTarget { .. } => StatusCode::BAD_REQUEST,
            Self::Connection(_) => StatusCode::BAD_GATEWAY,
            Self::Backend { status, .. } => *status,
            Self::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::InvalidTarget { .. } => "InvalidTargetUrl",
            Self::Connection(_) => "ConnectionError",
            Self::Backend { .. } => "BackendError",
            Self::Unknown { .. } => "UnknownError",
            Self::NotFound(_) => "NotFound",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (upstream_status, details) = match self {
            Self::InvalidTarget { details, .. } => (None, Some(details.clone())),
            Self::Backend { status, body, .. } => (Some(status.as_u16()), Some(body.clone())),
            Self::Unknown { details, .. } => (None, details.clone()),
            _ => (None, None),
        };

        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                r#type: self.kind().to_string(),
                details,
                status: upstream_status,
            },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}

/// `{"error": {"message", "type", "details"?, "status"?}}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Upstream status code, present only for passed-through backend errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_keeps_upstream_status_and_body() {
        let err = ProxyError::Backend {
            status: StatusCode::TOO_MANY_REQUESTS,
            reason: "Too Many Requests".to_string(),
            body: r#"{"error":"rate limited"}"#.to_string(),
        };

        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(json["error"]["type"], "BackendError");
        assert_eq!(json["error"]["status"], 429);
        assert_eq!(json["error"]["details"], r#"{"error":"rate limited"}"#);
    }

    #[test]
    fn envelope_omits_empty_optional_fields() {
        let json = serde_json::to_value(ProxyError::Connection("refused".into()).envelope()).unwrap();
        assert_eq!(json["error"]["type"], "ConnectionError");
        assert!(json["error"].get("details").is_none());
        assert!(json["error"].get("status").is_none());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::InvalidTarget { target: "x".into(), details: "y".into() }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Connection("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::unknown("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
