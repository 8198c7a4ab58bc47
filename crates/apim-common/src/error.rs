//! Error type shared by the APIM crates
//!
//! Validation errors name the offending resource and, where known, the
//! JSON field path (`items[1].spec.accessControl.allow[0]`). The HTTP
//! layer turns them into 400 responses carrying that path.

use thiserror::Error;

/// Resource placeholder for validation errors raised before a name is known
pub const UNNAMED: &str = "request";

/// Error type for APIM operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource definition or request
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.accessControl.allow[0]")
        field: Option<String>,
    },

    /// A document that is not well-formed JSON or YAML for its kind
    #[error("malformed {kind}: {message}")]
    Serialization {
        /// Kind being read or written
        kind: String,
        /// Decoder message
        message: String,
    },

    /// Local setup failure, tagged with the step that failed
    #[error("{step} failed: {message}")]
    Internal {
        /// Operation that failed, e.g. `create_client`
        step: String,
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNNAMED.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// A decoding or encoding failure for `kind`
    pub fn serialization(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// A setup failure in `step`
    pub fn internal(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Re-attribute a validation error to `field` of `resource`
    ///
    /// Other errors pass through unchanged.
    pub fn at(self, resource: impl Into<String>, field: impl Into<String>) -> Self {
        match self {
            Error::Validation { message, .. } => Self::validation_for_field(resource, field, message),
            other => other,
        }
    }

    /// Whether repeating the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::Validation { .. } | Error::Serialization { .. } | Error::Internal { .. } => {
                false
            }
        }
    }

    /// Get the field path if this is a field-level validation error
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Get the resource name if this error is tied to one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

/// Whether a kube error is worth retrying (connection problems, 5xx, 429)
///
/// Undecodable responses and requests that could not be built fail the
/// same way on every attempt.
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn validation_errors_carry_resource_and_field() {
        let err = Error::validation_for_field(
            "office-ip-allow",
            "spec.accessControl.allow[1]",
            "'10.0.0.300' is not an IP address or CIDR",
        );
        assert!(err.to_string().contains("office-ip-allow"));
        assert!(err.to_string().contains("10.0.0.300"));
        assert_eq!(err.field(), Some("spec.accessControl.allow[1]"));
        assert_eq!(err.resource(), Some("office-ip-allow"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unnamed_validation_has_no_field() {
        let err = Error::validation("empty list");
        assert_eq!(err.resource(), Some(UNNAMED));
        assert_eq!(err.field(), None);
    }

    #[test]
    fn at_moves_a_bare_validation_error_to_a_field() {
        let err = Error::validation("'10.0.0' is not an IP address").at("edge", "external_ips[1]");
        assert_eq!(err.resource(), Some("edge"));
        assert_eq!(err.field(), Some("external_ips[1]"));
        assert_eq!(
            err.to_string(),
            "validation error for edge: '10.0.0' is not an IP address"
        );

        let err = Error::internal("create_client", "boom").at("edge", "x");
        assert_eq!(err.field(), None);
    }

    #[test]
    fn malformed_documents_name_their_kind() {
        let err = Error::serialization("PolicyList", "expected value at line 1 column 1");
        assert_eq!(
            err.to_string(),
            "malformed PolicyList: expected value at line 1 column 1"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn setup_failures_name_the_step() {
        let err = Error::internal("create_client", "failed to infer config");
        assert_eq!(err.to_string(), "create_client failed: failed to infer config");
        assert!(!err.is_retryable());
    }

    #[test]
    fn kube_client_errors_are_not_retried() {
        assert!(!Error::from(api_error(404, "NotFound")).is_retryable());
        assert!(!Error::from(api_error(409, "AlreadyExists")).is_retryable());
        assert!(!Error::from(api_error(422, "Invalid")).is_retryable());
    }

    #[test]
    fn kube_server_errors_are_retried() {
        assert!(Error::from(api_error(500, "InternalError")).is_retryable());
        assert!(Error::from(api_error(503, "ServiceUnavailable")).is_retryable());
        assert!(Error::from(api_error(429, "TooManyRequests")).is_retryable());
    }

    #[test]
    fn undecodable_responses_are_not_retried() {
        let err = kube::Error::SerdeError(serde_json::from_str::<u8>("x").unwrap_err());
        assert!(!is_transient_kube_error(&err));
        assert!(!Error::from(err).is_retryable());
    }
}
