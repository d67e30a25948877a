use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error taxonomy shared by the cache, registry, controller and extender.
///
/// CLI-level plumbing (cert loading, kubeconfig, file I/O) keeps using
/// `anyhow::Result` with `.context(...)` — this type exists only where a
/// caller needs to match on the *kind* of failure, not just its message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TasError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TasError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TasError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TasError::NotFound(_) => StatusCode::NOT_FOUND,
            TasError::TransportError(_) => StatusCode::BAD_GATEWAY,
            TasError::ProtocolError(_) => StatusCode::BAD_REQUEST,
            TasError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TasError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for TasError {
    fn from(e: kube::Error) -> Self {
        TasError::TransportError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_400() {
        let e = TasError::InvalidArgument("empty metric name".into());
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = TasError::NotFound("policy default/p1".into());
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_maps_to_500() {
        let e = TasError::Internal("registry corruption".into());
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn display_messages_are_readable() {
        let e = TasError::ProtocolError("wrong content-type".into());
        assert_eq!(e.to_string(), "protocol error: wrong content-type");
    }
}
