//! Errors for peer calls and the inbound HTTP surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, Error>;

/// RPC error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request could not be sent or its response not read
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Shared secret missing or wrong
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Peer answered with a non-success status
    #[error("peer returned {status}: {body}")]
    PeerStatus {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Request payload could not be decoded
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Response payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Twirp error code for the variant
    fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "unauthenticated",
            Error::BadRequest(_) => "invalid_argument",
            Error::Http(_) | Error::PeerStatus { .. } => "unavailable",
            Error::Serialization(_) | Error::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Http(_) | Error::PeerStatus { .. } => StatusCode::BAD_GATEWAY,
            Error::Serialization(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "code": self.code(),
            "msg": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_401() {
        let response = Error::Unauthorized("token mismatch".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bad_payloads_map_to_400() {
        let response = Error::BadRequest("not base64".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn peer_failures_name_the_status() {
        let err = Error::PeerStatus {
            status: 503,
            body: "draining".into(),
        };
        assert_eq!(err.to_string(), "peer returned 503: draining");
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
