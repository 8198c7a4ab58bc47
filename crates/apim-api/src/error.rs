//! Error types for the gateway API

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Result type for gateway API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway API operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request body or parameters failed validation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Target object doesn't exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists or was modified concurrently
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other error response from the Kubernetes API server
    #[error("kubernetes API error ({code}): {message}")]
    KubeApi {
        /// Status code the API server answered with
        code: u16,
        /// Message from the API server
        message: String,
    },

    /// The Kubernetes API server could not be reached
    #[error("kubernetes API unavailable: {0}")]
    Unavailable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is answered with
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::KubeApi { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            error!(code = status.as_u16(), error = %message, "Request failed");
        }

        // Return K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                400 | 422 => Error::BadRequest(ae.message),
                404 => Error::NotFound(ae.message),
                409 => Error::Conflict(ae.message),
                code => Error::KubeApi {
                    code,
                    message: ae.message,
                },
            },
            other => Error::Unavailable(other.to_string()),
        }
    }
}

impl From<apim_common::Error> for Error {
    fn from(e: apim_common::Error) -> Self {
        match e {
            apim_common::Error::Kube { source } => source.into(),
            apim_common::Error::Validation {
                resource,
                message,
                field: Some(field),
            } => Error::BadRequest(format!("{resource}: {field}: {message}")),
            apim_common::Error::Validation {
                resource, message, ..
            } => Error::BadRequest(format!("{resource}: {message}")),
            apim_common::Error::Serialization { kind, message } => {
                Error::BadRequest(format!("malformed {kind}: {message}"))
            }
            apim_common::Error::Internal { step, message } => {
                Error::Internal(format!("{step} failed: {message}"))
            }
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(e: JsonRejection) -> Self {
        Error::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(e: QueryRejection) -> Self {
        Error::BadRequest(e.body_text())
    }
}
