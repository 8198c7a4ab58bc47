//! NGINX Ingress Controller custom resources managed by the gateway

mod policy;
mod virtual_server;

pub use policy::{
    AccessControl, ApplyRange, IpRuleKind, Policy, PolicySpec, PolicyStatus,
};
pub use virtual_server::{
    ActionProxy, ActionRedirect, ActionReturn, PolicyReference, Route, RouteAction,
    ServerUpstream, Tls, TlsRedirect, VirtualServer, VirtualServerSpec, VirtualServerStatus,
    REDIRECT_CODES,
};

use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State the NGINX Ingress Controller reports for a resource
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourceState {
    /// Accepted and configured
    Valid,
    /// Rejected
    Invalid,
    /// Accepted with warnings
    Warning,
    /// Not yet reported, or a state this gateway doesn't know
    #[default]
    #[serde(other)]
    Unknown,
}

/// Render the CRDs for the managed resources as a multi-document YAML stream
pub fn crds_yaml() -> Result<String, crate::Error> {
    let mut out = String::new();
    for crd in [Policy::crd(), VirtualServer::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| crate::Error::serialization("CustomResourceDefinition", e.to_string()))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}
