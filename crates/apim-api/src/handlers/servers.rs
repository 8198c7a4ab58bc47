//! Servers (`/kubeapi/servers`) backed by NGINX VirtualServers

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use apim_common::crd::{ResourceState, VirtualServer, VirtualServerSpec};
use apim_common::validation::{validate_namespace, validate_resource_name};

use super::{replace_error, single_match, Data, Message, NamespaceQuery, TargetQuery};
use crate::cluster::Scope;
use crate::error::Result;
use crate::server::AppState;

/// Identity of a listed server
#[derive(Debug, Serialize)]
pub struct ServerMetadata {
    /// Kubernetes UID
    pub uid: Option<String>,
    /// VirtualServer name
    pub name: String,
    /// VirtualServer namespace
    pub namespace: String,
}

/// A VirtualServer as the gateway reports it
#[derive(Debug, Serialize)]
pub struct ServerItem {
    /// Identity
    pub metadata: ServerMetadata,
    /// Spec as stored
    pub spec: VirtualServerSpec,
    /// State reported by the ingress controller
    pub state: ResourceState,
}

impl ServerItem {
    fn from_virtual_server(vs: &VirtualServer) -> Self {
        Self {
            metadata: ServerMetadata {
                uid: vs.uid(),
                name: vs.name_any(),
                namespace: vs.namespace().unwrap_or_default(),
            },
            spec: vs.spec.clone(),
            state: vs.status.as_ref().map(|s| s.state).unwrap_or_default(),
        }
    }
}

/// Body of a create request
#[derive(Debug, Deserialize)]
pub struct CreateServer {
    /// VirtualServer name
    pub name: String,
    /// Namespace to create it in
    pub namespace: String,
    /// Host, TLS, policies, upstreams and routes
    pub spec: VirtualServerSpec,
}

/// List VirtualServers in every namespace
pub async fn list(State(state): State<AppState>) -> Result<Json<Data<Vec<ServerItem>>>> {
    list_in(&state, Scope::Cluster).await
}

/// List VirtualServers in one namespace
pub async fn list_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<Data<Vec<ServerItem>>>> {
    validate_namespace(&namespace)?;
    list_in(&state, Scope::Namespace(namespace)).await
}

async fn list_in(state: &AppState, scope: Scope) -> Result<Json<Data<Vec<ServerItem>>>> {
    let servers = state.cluster.list_virtual_servers(scope).await?;
    Ok(Json(Data::new(
        servers.iter().map(ServerItem::from_virtual_server).collect(),
    )))
}

/// Create a VirtualServer
pub async fn create(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateServer>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>)> {
    let Json(req) = body?;
    validate_resource_name(&req.name)?;
    validate_namespace(&req.namespace)?;
    req.spec.validate(&req.name)?;

    let server = VirtualServer {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            namespace: Some(req.namespace.clone()),
            ..Default::default()
        },
        spec: req.spec,
        status: None,
    };

    let created = state
        .cluster
        .create_virtual_server(&req.namespace, server)
        .await?;

    info!(
        server = %req.name,
        namespace = %req.namespace,
        host = %created.spec.host,
        "Created VirtualServer"
    );

    Ok((
        StatusCode::CREATED,
        Json(
            Message::new(format!(
                "server '{}' created in namespace '{}'",
                req.name, req.namespace
            ))
            .with_uid(created.uid()),
        ),
    ))
}

/// Replace the spec of a VirtualServer found by name
pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: std::result::Result<Query<NamespaceQuery>, QueryRejection>,
    body: std::result::Result<Json<VirtualServerSpec>, JsonRejection>,
) -> Result<Json<Message>> {
    let Query(query) = query?;
    let Json(spec) = body?;
    spec.validate(&name)?;

    let mut server = find(&state, &name, query.namespace).await?;
    let namespace = server.namespace().unwrap_or_default();

    // resourceVersion from the read guards against concurrent writers
    server.spec = spec;
    server.status = None;
    server.metadata.managed_fields = None;
    let updated = state
        .cluster
        .replace_virtual_server(&namespace, server)
        .await
        .map_err(|e| replace_error("server", &name, e))?;

    info!(server = %name, namespace = %namespace, "Updated VirtualServer");

    Ok(Json(
        Message::new(format!("server '{name}' updated in namespace '{namespace}'"))
            .with_uid(updated.uid()),
    ))
}

/// Delete a VirtualServer (`?name=`)
pub async fn delete(
    State(state): State<AppState>,
    query: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<Message>> {
    let Query(target) = query?;
    let server = find(&state, &target.name, target.namespace).await?;
    let namespace = server.namespace().unwrap_or_default();
    let name = server.name_any();

    state
        .cluster
        .delete_virtual_server(&namespace, &name)
        .await?;

    info!(server = %name, namespace = %namespace, "Deleted VirtualServer");

    Ok(Json(Message::new(format!(
        "server '{name}' deleted from namespace '{namespace}'"
    ))))
}

async fn find(state: &AppState, name: &str, namespace: Option<String>) -> Result<VirtualServer> {
    if let Some(ns) = &namespace {
        validate_namespace(ns)?;
    }
    let servers = state
        .cluster
        .list_virtual_servers(Scope::from_namespace(namespace))
        .await?;
    single_match("server", name, &servers).cloned()
}
