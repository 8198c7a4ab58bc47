//! Route definitions (`/kubeapi/routes`)
//!
//! Routes have no Kubernetes object of their own; they live inside a
//! VirtualServer. The endpoint validates a definition and echoes it back so
//! clients can assemble servers from checked parts.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use apim_common::crd::Route;
use apim_common::validation::validate_resource_name;

use crate::error::Result;

/// A named route definition
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteItem {
    /// Client side route name
    pub name: String,
    /// Path, policies and action as they appear in `spec.routes[]`
    #[serde(flatten)]
    pub route: Route,
}

/// Echo of an accepted route
#[derive(Debug, Serialize)]
pub struct RouteCreated {
    /// Route name
    #[serde(rename = "route-name")]
    pub route_name: String,
    /// The validated definition
    pub spec: RouteItem,
}

/// Validate a route definition
pub async fn create(
    body: std::result::Result<Json<RouteItem>, JsonRejection>,
) -> Result<(StatusCode, Json<RouteCreated>)> {
    let Json(item) = body?;
    validate_resource_name(&item.name)?;
    item.route.validate(&item.name, "route")?;

    debug!(route = %item.name, path = %item.route.path, "Validated route");

    Ok((
        StatusCode::CREATED,
        Json(RouteCreated {
            route_name: item.name.clone(),
            spec: item,
        }),
    ))
}
