//! APIM gateway API
//!
//! A REST surface over the NGINX Ingress Controller resources of a cluster.
//! Runs in-cluster under a ServiceAccount and talks to the Kubernetes API
//! through [`cluster::ClusterApi`].
//!
//! # Architecture
//!
//! ```text
//! HTTP client ──► axum router ──► handlers ──► ClusterApi ──► K8s API Server
//!                 (CORS, trace)                (kube-rs)
//! ```
//!
//! # Endpoints
//!
//! - `/kubeapi/ipallow`, `/kubeapi/ipdeny` - IP access control policies
//! - `/kubeapi/upstreams` - Services and external upstreams
//! - `/kubeapi/routes` - Route validation
//! - `/kubeapi/servers` - VirtualServers
//! - `/kubeapi/certs` - TLS Secrets
//! - `GET /healthz` - Health check

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod handlers;
pub mod server;

pub use cluster::{ClusterApi, KubeClusterApi, Scope};
pub use error::{Error, Result};
pub use server::{router, start_server, AppState, ServerConfig};
