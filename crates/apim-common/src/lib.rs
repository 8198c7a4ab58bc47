//! Common types for the APIM gateway: NGINX Ingress CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod client;
pub mod crd;
pub mod error;
pub mod policy_list;
pub mod retry;
pub mod telemetry;
pub mod validation;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the NGINX Ingress Controller custom resources
pub const NGINX_GROUP: &str = "k8s.nginx.org";

/// apiVersion of the NGINX Ingress Controller custom resources
pub const NGINX_API_VERSION: &str = "k8s.nginx.org/v1";

/// Namespace the NGINX Ingress Controller is deployed to; policies live here
pub const DEFAULT_POLICY_NAMESPACE: &str = "nginx-ingress";

/// Label key used to tag IP access control policies (`ip-allow` / `ip-deny`)
pub const POLICY_TYPE_LABEL: &str = "type";

/// Annotation carrying the requested apply range of an IP access control policy
pub const APPLY_RANGE_ANNOTATION: &str = "apim.k8s.nginx.org/apply-range";

/// Label key marking Services that front addresses outside the cluster
pub const UPSTREAM_LABEL: &str = "upstream";

/// Value of [`UPSTREAM_LABEL`] for external upstreams
pub const UPSTREAM_EXTERNAL: &str = "external";

/// Label selector for external upstream Services
pub const UPSTREAM_EXTERNAL_SELECTOR: &str = "upstream=external";

/// Secret type of TLS certificates
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Suffix appended to certificate names to form the Secret name
pub const CERT_SECRET_SUFFIX: &str = "-cert";
