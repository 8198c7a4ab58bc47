//! Gateway HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use apim_common::DEFAULT_POLICY_NAMESPACE;

use crate::cluster::ClusterApi;
use crate::error::Error;
use crate::handlers::{certs, ip_policy, routes, servers, upstreams};

/// Default listen address
pub const DEFAULT_ADDR: &str = "0.0.0.0:8000";

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// Namespace IP access control policies are created in
    pub policy_namespace: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            policy_namespace: DEFAULT_POLICY_NAMESPACE.to_string(),
        }
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Kubernetes API access
    pub cluster: Arc<dyn ClusterApi>,
    /// Namespace IP access control policies live in
    pub policy_namespace: String,
}

impl AppState {
    /// Build state around a cluster implementation
    pub fn new(cluster: Arc<dyn ClusterApi>, policy_namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            policy_namespace: policy_namespace.into(),
        }
    }
}

/// Build the gateway router
///
/// Single-segment paths under `upstreams`, `servers` and `certs` are a
/// namespace on GET and an object name on PUT.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/healthz", get(|| async { "ok" }))
        // IP access control policies
        .route(
            "/kubeapi/ipallow",
            get(ip_policy::list::<ip_policy::Allow>).post(ip_policy::create::<ip_policy::Allow>),
        )
        .route(
            "/kubeapi/ipallow/{name}",
            get(ip_policy::get::<ip_policy::Allow>)
                .put(ip_policy::update::<ip_policy::Allow>)
                .delete(ip_policy::delete::<ip_policy::Allow>),
        )
        .route(
            "/kubeapi/ipdeny",
            get(ip_policy::list::<ip_policy::Deny>).post(ip_policy::create::<ip_policy::Deny>),
        )
        .route(
            "/kubeapi/ipdeny/{name}",
            get(ip_policy::get::<ip_policy::Deny>)
                .put(ip_policy::update::<ip_policy::Deny>)
                .delete(ip_policy::delete::<ip_policy::Deny>),
        )
        // External upstreams (Service + Endpoints)
        .route(
            "/kubeapi/upstreams",
            get(upstreams::list)
                .post(upstreams::create)
                .delete(upstreams::delete),
        )
        .route(
            "/kubeapi/upstreams/{name}",
            get(upstreams::list_namespace).put(upstreams::update),
        )
        // Routes are validated here and embedded in servers by the caller
        .route("/kubeapi/routes", post(routes::create))
        // VirtualServers
        .route(
            "/kubeapi/servers",
            get(servers::list)
                .post(servers::create)
                .delete(servers::delete),
        )
        .route(
            "/kubeapi/servers/{name}",
            get(servers::list_namespace).put(servers::update),
        )
        // TLS certificates
        .route(
            "/kubeapi/certs",
            get(certs::list).post(certs::create).delete(certs::delete),
        )
        .route("/kubeapi/certs/{namespace}", get(certs::list_namespace))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the gateway server and serve until ctrl-c
pub async fn start_server(config: ServerConfig, cluster: Arc<dyn ClusterApi>) -> Result<(), Error> {
    let state = AppState::new(cluster, config.policy_namespace.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.addr, e)))?;

    info!(
        addr = %config.addr,
        policy_namespace = %config.policy_namespace,
        "Starting APIM gateway"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    info!("APIM gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
