use axum::body::Body;
use axum::http::{Method, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of one proxied request.
///
/// None of these ever write to the cache; each maps to a plain-text response
/// carrying the error message.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0} is not supported: plaintext HTTP proxy only")]
    UnsupportedMethod(Method),

    #[error("request target must be an absolute http URL, got {0}")]
    RelativeTarget(Uri),

    #[error("failed to build upstream request: {0}")]
    BuildRequest(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to read upstream response body: {0}")]
    BodyRead(#[from] hyper::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        (self.status(), self.to_string()).into_response()
    }
}
