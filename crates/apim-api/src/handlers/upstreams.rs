//! Upstreams (`/kubeapi/upstreams`)
//!
//! Any Service can be listed as an upstream. External upstreams are created
//! by the gateway as a selector-less Service labelled `upstream=external`
//! plus a same-named Endpoints object listing the outside addresses.

use std::collections::{BTreeMap, HashSet};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use apim_common::client::is_not_found;
use apim_common::validation::{
    parse_endpoint_ip, validate_namespace, validate_port, validate_resource_name,
};
use apim_common::{UPSTREAM_EXTERNAL, UPSTREAM_EXTERNAL_SELECTOR, UPSTREAM_LABEL};

use super::{replace_error, single_match, Data, Message, NamespaceQuery, TargetQuery};
use crate::cluster::Scope;
use crate::error::{Error, Result};
use crate::server::AppState;

/// A Service as the gateway reports it
#[derive(Debug, Serialize)]
pub struct UpstreamItem {
    /// Kubernetes UID
    pub uid: Option<String>,
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
    /// Service ports
    pub ports: Vec<i32>,
    /// Whether the gateway manages this Service as an external upstream
    pub external: bool,
}

impl UpstreamItem {
    fn from_service(service: &Service) -> Self {
        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default();

        Self {
            uid: service.uid(),
            name: service.name_any(),
            namespace: service.namespace().unwrap_or_default(),
            ports,
            external: service.labels().get(UPSTREAM_LABEL).map(String::as_str)
                == Some(UPSTREAM_EXTERNAL),
        }
    }
}

/// Body of a create request
#[derive(Debug, Deserialize)]
pub struct CreateUpstream {
    /// Service and Endpoints name
    pub name: String,
    /// Namespace to create both objects in
    pub namespace: String,
    /// Addresses outside the cluster
    pub external_ips: Vec<String>,
    /// Port the Service exposes
    pub service_port: i32,
    /// Port on the external addresses
    pub target_port: i32,
}

/// Body of an update request
#[derive(Debug, Deserialize)]
pub struct UpdateUpstream {
    /// Replacement address list
    pub external_ips: Vec<String>,
    /// Port the Service exposes
    pub service_port: i32,
    /// Port on the external addresses
    pub target_port: i32,
}

/// List Services in every namespace
pub async fn list(State(state): State<AppState>) -> Result<Json<Data<Vec<UpstreamItem>>>> {
    list_in(&state, Scope::Cluster).await
}

/// List Services in one namespace
pub async fn list_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<Data<Vec<UpstreamItem>>>> {
    validate_namespace(&namespace)?;
    list_in(&state, Scope::Namespace(namespace)).await
}

async fn list_in(state: &AppState, scope: Scope) -> Result<Json<Data<Vec<UpstreamItem>>>> {
    let services = state.cluster.list_services(scope, None).await?;
    Ok(Json(Data::new(
        services.iter().map(UpstreamItem::from_service).collect(),
    )))
}

/// Create an external upstream
pub async fn create(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateUpstream>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>)> {
    let Json(req) = body?;
    validate_resource_name(&req.name)?;
    validate_namespace(&req.namespace)?;
    let ips = external_ips(&req.name, &req.external_ips)?;
    check_ports(&req.name, req.service_port, req.target_port)?;

    let service = external_service(&req.name, &req.namespace, req.service_port, req.target_port);
    let endpoints = Endpoints {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            namespace: Some(req.namespace.clone()),
            ..Default::default()
        },
        subsets: Some(endpoint_subsets(&ips, req.target_port)),
    };

    let created = state
        .cluster
        .create_service(&req.namespace, service)
        .await?;

    if let Err(e) = state
        .cluster
        .create_endpoints(&req.namespace, endpoints)
        .await
    {
        // Don't leave a Service without addresses behind
        if let Err(rollback) = state.cluster.delete_service(&req.namespace, &req.name).await {
            warn!(
                upstream = %req.name,
                namespace = %req.namespace,
                error = %rollback,
                "Failed to roll back Service after Endpoints creation failed"
            );
        }
        return Err(e.into());
    }

    info!(
        upstream = %req.name,
        namespace = %req.namespace,
        addresses = ips.len(),
        "Created external upstream"
    );

    Ok((
        StatusCode::CREATED,
        Json(
            Message::new(format!(
                "upstream '{}' created in namespace '{}'",
                req.name, req.namespace
            ))
            .with_uid(created.uid()),
        ),
    ))
}

/// Replace ports and addresses of an external upstream
pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: std::result::Result<Query<NamespaceQuery>, QueryRejection>,
    body: std::result::Result<Json<UpdateUpstream>, JsonRejection>,
) -> Result<Json<Message>> {
    let Query(query) = query?;
    let Json(req) = body?;
    let ips = external_ips(&name, &req.external_ips)?;
    check_ports(&name, req.service_port, req.target_port)?;

    let mut service = find_external(&state, &name, query.namespace).await?;
    let namespace = service.namespace().unwrap_or_default();

    // Mutate the fetched object so clusterIP and resourceVersion carry over
    let previous_ports = service.spec.as_ref().and_then(|spec| spec.ports.clone());
    service
        .spec
        .get_or_insert_with(ServiceSpec::default)
        .ports = Some(vec![service_port(req.service_port, req.target_port)]);
    service
        .labels_mut()
        .insert(UPSTREAM_LABEL.to_string(), UPSTREAM_EXTERNAL.to_string());
    let updated = state
        .cluster
        .replace_service(&namespace, service)
        .await
        .map_err(|e| replace_error("upstream", &name, e))?;

    let subsets = endpoint_subsets(&ips, req.target_port);
    if let Err(e) = write_endpoints(&state, &namespace, &name, subsets).await {
        restore_ports(&state, &namespace, updated, previous_ports).await;
        return Err(e);
    }

    info!(upstream = %name, namespace = %namespace, "Updated external upstream");

    Ok(Json(
        Message::new(format!(
            "upstream '{name}' updated in namespace '{namespace}'"
        ))
        .with_uid(updated.uid()),
    ))
}

/// Point the Endpoints object at `subsets`, creating it when missing
async fn write_endpoints(
    state: &AppState,
    namespace: &str,
    name: &str,
    subsets: Vec<EndpointSubset>,
) -> Result<()> {
    match state.cluster.get_endpoints(namespace, name).await {
        Ok(mut endpoints) => {
            endpoints.subsets = Some(subsets);
            state
                .cluster
                .replace_endpoints(namespace, endpoints)
                .await
                .map_err(|e| replace_error("upstream endpoints", name, e))?;
        }
        Err(e) if is_not_found(&e) => {
            let endpoints = Endpoints {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                subsets: Some(subsets),
            };
            state.cluster.create_endpoints(namespace, endpoints).await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Put the Service ports back after the Endpoints write failed
async fn restore_ports(
    state: &AppState,
    namespace: &str,
    mut service: Service,
    ports: Option<Vec<ServicePort>>,
) {
    let name = service.name_any();
    service.spec.get_or_insert_with(ServiceSpec::default).ports = ports;
    match state.cluster.replace_service(namespace, service).await {
        Ok(_) => warn!(
            upstream = %name,
            namespace = %namespace,
            "Endpoints update failed, restored previous service ports"
        ),
        Err(e) => warn!(
            upstream = %name,
            namespace = %namespace,
            error = %e,
            "Endpoints update failed and service ports could not be restored; service and endpoints disagree"
        ),
    }
}

/// Delete an external upstream (`?name=`)
pub async fn delete(
    State(state): State<AppState>,
    query: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<Message>> {
    let Query(target) = query?;
    let service = find_external(&state, &target.name, target.namespace).await?;
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();

    let endpoints_deleted = deleted(state.cluster.delete_endpoints(&namespace, &name).await)?;
    let service_deleted = deleted(state.cluster.delete_service(&namespace, &name).await)?;

    if !endpoints_deleted && !service_deleted {
        return Err(Error::NotFound(format!("upstream '{name}'")));
    }

    info!(upstream = %name, namespace = %namespace, "Deleted external upstream");

    Ok(Json(Message::new(format!(
        "upstream '{name}' deleted from namespace '{namespace}'"
    ))))
}

/// Locate an external upstream Service by name, optionally within one namespace
async fn find_external(
    state: &AppState,
    name: &str,
    namespace: Option<String>,
) -> Result<Service> {
    if let Some(ns) = &namespace {
        validate_namespace(ns)?;
    }

    let services = state
        .cluster
        .list_services(
            Scope::from_namespace(namespace),
            Some(UPSTREAM_EXTERNAL_SELECTOR.to_string()),
        )
        .await?;
    single_match("external upstream", name, &services).cloned()
}

/// `Ok(false)` when the object was already gone
fn deleted(result: std::result::Result<(), kube::Error>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn external_ips(resource: &str, values: &[String]) -> Result<Vec<String>> {
    if values.is_empty() {
        return Err(Error::BadRequest(format!(
            "{resource}: external_ips: at least one address is required"
        )));
    }

    let mut seen = HashSet::new();
    let mut ips = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let ip = parse_endpoint_ip(value).map_err(|e| e.at(resource, format!("external_ips[{i}]")))?;
        let ip = ip.to_string();
        if seen.insert(ip.clone()) {
            ips.push(ip);
        }
    }
    Ok(ips)
}

fn check_ports(resource: &str, service_port: i32, target_port: i32) -> Result<()> {
    validate_port(service_port).map_err(|e| e.at(resource, "service_port"))?;
    validate_port(target_port).map_err(|e| e.at(resource, "target_port"))?;
    Ok(())
}

fn service_port(port: i32, target_port: i32) -> ServicePort {
    ServicePort {
        port,
        target_port: Some(IntOrString::Int(target_port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn external_service(name: &str, namespace: &str, port: i32, target_port: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                UPSTREAM_LABEL.to_string(),
                UPSTREAM_EXTERNAL.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![service_port(port, target_port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoint_subsets(ips: &[String], target_port: i32) -> Vec<EndpointSubset> {
    vec![EndpointSubset {
        addresses: Some(
            ips.iter()
                .map(|ip| EndpointAddress {
                    ip: ip.clone(),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(vec![EndpointPort {
            port: target_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }]
}
