//! TLS certificates (`/kubeapi/certs`) stored as `kubernetes.io/tls` Secrets

use std::collections::BTreeMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::core::PartialObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use apim_common::validation::{validate_namespace, validate_pem, validate_resource_name};
use apim_common::{CERT_SECRET_SUFFIX, TLS_SECRET_TYPE};

use super::{single_match, Data, Message, TargetQuery};
use crate::cluster::Scope;
use crate::error::{Error, Result};
use crate::server::AppState;

/// Secret data key of the certificate chain
pub const TLS_CRT_KEY: &str = "tls.crt";

/// Secret data key of the private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// A TLS Secret as the gateway reports it
#[derive(Debug, Serialize)]
pub struct CertItem {
    /// Kubernetes UID
    pub uid: Option<String>,
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Secret type
    #[serde(rename = "type")]
    pub type_: Option<String>,
}

impl CertItem {
    /// Listing selects on `type`, so every item carries the TLS type
    fn from_meta(secret: &PartialObjectMeta<Secret>) -> Self {
        Self {
            uid: secret.uid(),
            name: secret.name_any(),
            namespace: secret.namespace().unwrap_or_default(),
            type_: Some(TLS_SECRET_TYPE.to_string()),
        }
    }
}

/// Body of a create request
#[derive(Debug, Deserialize)]
pub struct CreateCert {
    /// Certificate name; the Secret is `<name>-cert`
    pub name: String,
    /// Namespace of the Secret
    pub namespace: String,
    /// PEM certificate chain
    pub tls_crt: String,
    /// PEM private key
    pub tls_key: String,
}

/// List TLS Secrets in every namespace
pub async fn list(State(state): State<AppState>) -> Result<Json<Data<Vec<CertItem>>>> {
    list_in(&state, Scope::Cluster).await
}

/// List TLS Secrets in one namespace
pub async fn list_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<Data<Vec<CertItem>>>> {
    validate_namespace(&namespace)?;
    list_in(&state, Scope::Namespace(namespace)).await
}

async fn list_in(state: &AppState, scope: Scope) -> Result<Json<Data<Vec<CertItem>>>> {
    let secrets = state.cluster.list_tls_secrets(scope).await?;
    Ok(Json(Data::new(
        secrets.iter().map(CertItem::from_meta).collect(),
    )))
}

/// Store a certificate and key as a TLS Secret
pub async fn create(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateCert>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>)> {
    let Json(req) = body?;
    let secret_name = format!("{}{}", req.name, CERT_SECRET_SUFFIX);
    validate_resource_name(&secret_name)?;
    validate_namespace(&req.namespace)?;
    validate_pem(&req.tls_crt, "tls_crt").map_err(|e| e.at(&secret_name, "tls_crt"))?;
    validate_pem(&req.tls_key, "tls_key").map_err(|e| e.at(&secret_name, "tls_key"))?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(req.namespace.clone()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([
            (
                TLS_CRT_KEY.to_string(),
                ByteString(req.tls_crt.trim().as_bytes().to_vec()),
            ),
            (
                TLS_KEY_KEY.to_string(),
                ByteString(req.tls_key.trim().as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    };

    let created = state.cluster.create_secret(&req.namespace, secret).await?;

    info!(secret = %secret_name, namespace = %req.namespace, "Created TLS secret");

    Ok((
        StatusCode::CREATED,
        Json(
            Message::new(format!(
                "certificate '{secret_name}' created in namespace '{}'",
                req.namespace
            ))
            .with_uid(created.uid()),
        ),
    ))
}

/// Delete a TLS Secret by `<name>-cert`, falling back to `<name>` (`?name=`)
pub async fn delete(
    State(state): State<AppState>,
    query: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<Message>> {
    let Query(target) = query?;
    if let Some(ns) = &target.namespace {
        validate_namespace(ns)?;
    }

    let secrets = state
        .cluster
        .list_tls_secrets(Scope::from_namespace(target.namespace))
        .await?;

    let suffixed = format!("{}{}", target.name, CERT_SECRET_SUFFIX);
    let secret = match single_match("certificate", &suffixed, &secrets) {
        Err(Error::NotFound(_)) => single_match("certificate", &target.name, &secrets)?,
        other => other?,
    };
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();

    state.cluster.delete_secret(&namespace, &name).await?;

    info!(secret = %name, namespace = %namespace, "Deleted TLS secret");

    Ok(Json(Message::new(format!(
        "certificate '{name}' deleted from namespace '{namespace}'"
    ))))
}
