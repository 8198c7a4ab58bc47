//! NGINX `VirtualServer` CRD (`k8s.nginx.org/v1`)
//!
//! A VirtualServer binds a host to upstreams and routes. The gateway exposes
//! these as "servers".

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceState;
use crate::validation::{reason, validate_host, validate_namespace, validate_port, validate_resource_name};
use crate::{Error, DEFAULT_POLICY_NAMESPACE};

/// Redirect status codes NGINX accepts for TLS and action redirects
pub const REDIRECT_CODES: [u16; 4] = [301, 302, 307, 308];

/// VirtualServer configures load balancing for a single host.
///
/// Example:
/// ```yaml
/// apiVersion: k8s.nginx.org/v1
/// kind: VirtualServer
/// metadata:
///   name: example-server
///   namespace: default
/// spec:
///   host: www.example.com
///   tls:
///     secret: myapp-cert
///     redirect:
///       enable: true
///   policies:
///     - name: office-ip-allow
///       namespace: nginx-ingress
///   upstreams:
///     - name: myapp
///       service: myapp-svc
///       port: 80
///   routes:
///     - path: /app
///       action:
///         pass: myapp
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "VirtualServer",
    namespaced,
    status = "VirtualServerStatus",
    shortname = "vs",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    /// Host name served, e.g. `www.example.com`
    pub host: String,

    /// TLS termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,

    /// Policies applied to every route of the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyReference>,

    /// Backends routes can pass traffic to
    #[serde(default)]
    pub upstreams: Vec<ServerUpstream>,

    /// Path based routing rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// TLS settings of a virtual server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    /// Name of the `kubernetes.io/tls` Secret in the server's namespace
    pub secret: String,

    /// HTTP to HTTPS redirect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<TlsRedirect>,
}

/// HTTP to HTTPS redirect settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsRedirect {
    /// Whether plain HTTP requests are redirected
    #[serde(default)]
    pub enable: bool,

    /// Status code of the redirect
    #[serde(default = "default_redirect_code")]
    pub code: u16,
}

impl Default for TlsRedirect {
    fn default() -> Self {
        Self {
            enable: false,
            code: default_redirect_code(),
        }
    }
}

fn default_redirect_code() -> u16 {
    301
}

fn default_policy_namespace() -> String {
    DEFAULT_POLICY_NAMESPACE.to_string()
}

fn default_route_path() -> String {
    "/".to_string()
}

/// Reference to a `Policy`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReference {
    /// Policy name
    pub name: String,

    /// Policy namespace; policies live next to the ingress controller
    #[serde(default = "default_policy_namespace")]
    pub namespace: String,
}

/// A backend Service of a virtual server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpstream {
    /// Name routes refer to
    pub name: String,
    /// Kubernetes Service name
    pub service: String,
    /// Service port
    pub port: i32,
}

/// A routing rule
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Location path: a prefix (`/app`), exact (`=/app`) or regex (`~ ^/app`)
    #[serde(default = "default_route_path")]
    pub path: String,

    /// Policies applied to this route only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyReference>,

    /// What to do with matching requests
    pub action: RouteAction,
}

/// Route action. Exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteAction {
    /// Pass requests to the named upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    /// Redirect requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<ActionRedirect>,

    /// Return a preconfigured response
    #[serde(default, rename = "return", skip_serializing_if = "Option::is_none")]
    pub return_: Option<ActionReturn>,

    /// Pass requests to an upstream with request/response rewrites
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ActionProxy>,
}

/// Redirect action
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRedirect {
    /// Target URL
    pub url: String,
    /// Redirect status code
    #[serde(default = "default_redirect_code")]
    pub code: u16,
}

/// Canned response action
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionReturn {
    /// Status code
    #[serde(default = "default_return_code")]
    pub code: u16,
    /// Content type of the body
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Response body
    pub body: String,
}

fn default_return_code() -> u16 {
    200
}

/// Proxy action
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionProxy {
    /// Upstream name
    pub upstream: String,
    /// Rewrite the request path before passing it on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_path: Option<String>,
}

/// VirtualServer status reported by the NGINX Ingress Controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    /// Whether the controller accepted the server
    #[serde(default)]
    pub state: ResourceState,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PolicyReference {
    fn validate(&self, resource: &str, field: &str) -> Result<(), Error> {
        validate_resource_name(&self.name)
            .and_then(|_| validate_namespace(&self.namespace))
            .map_err(|e| Error::validation_for_field(resource, field, reason(&e)))
    }
}

impl RouteAction {
    /// Upstream this action sends traffic to, if any
    pub fn upstream(&self) -> Option<&str> {
        self.pass
            .as_deref()
            .or_else(|| self.proxy.as_ref().map(|p| p.upstream.as_str()))
    }

    /// Validate the action in isolation (no upstream cross-check)
    pub fn validate(&self, resource: &str, field: &str) -> Result<(), Error> {
        let set = [
            self.pass.is_some(),
            self.redirect.is_some(),
            self.return_.is_some(),
            self.proxy.is_some(),
        ]
        .into_iter()
        .filter(|s| *s)
        .count();

        if set != 1 {
            return Err(Error::validation_for_field(
                resource,
                field,
                "exactly one of pass, redirect, return or proxy must be set",
            ));
        }

        if let Some(pass) = &self.pass {
            if pass.trim().is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.pass"),
                    "upstream name must not be empty",
                ));
            }
        }
        if let Some(redirect) = &self.redirect {
            if redirect.url.trim().is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.redirect.url"),
                    "url must not be empty",
                ));
            }
            if !REDIRECT_CODES.contains(&redirect.code) {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.redirect.code"),
                    format!("code must be one of {REDIRECT_CODES:?}"),
                ));
            }
        }
        if let Some(ret) = &self.return_ {
            if !(200..=599).contains(&ret.code) {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.return.code"),
                    "code must be between 200 and 599",
                ));
            }
        }
        if let Some(proxy) = &self.proxy {
            if proxy.upstream.trim().is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.proxy.upstream"),
                    "upstream name must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl Route {
    /// Validate the route in isolation
    pub fn validate(&self, resource: &str, field: &str) -> Result<(), Error> {
        let path = self.path.trim();
        let valid_path = path.starts_with('/') || path.starts_with('=') || path.starts_with('~');
        if !valid_path {
            return Err(Error::validation_for_field(
                resource,
                format!("{field}.path"),
                "path must start with '/', '=' or '~'",
            ));
        }
        for (i, policy) in self.policies.iter().enumerate() {
            policy.validate(resource, &format!("{field}.policies[{i}]"))?;
        }
        self.action.validate(resource, &format!("{field}.action"))
    }
}

impl VirtualServerSpec {
    /// Validate the whole spec, including that routes only use declared upstreams
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        validate_host(&self.host)
            .map_err(|e| Error::validation_for_field(resource, "spec.host", reason(&e)))?;

        if let Some(tls) = &self.tls {
            validate_resource_name(&tls.secret).map_err(|e| {
                Error::validation_for_field(resource, "spec.tls.secret", reason(&e))
            })?;
            if let Some(redirect) = &tls.redirect {
                if !REDIRECT_CODES.contains(&redirect.code) {
                    return Err(Error::validation_for_field(
                        resource,
                        "spec.tls.redirect.code",
                        format!("code must be one of {REDIRECT_CODES:?}"),
                    ));
                }
            }
        }

        for (i, policy) in self.policies.iter().enumerate() {
            policy.validate(resource, &format!("spec.policies[{i}]"))?;
        }

        let mut upstream_names = HashSet::new();
        for (i, upstream) in self.upstreams.iter().enumerate() {
            let field = format!("spec.upstreams[{i}]");
            validate_resource_name(&upstream.name)
                .and_then(|_| validate_resource_name(&upstream.service))
                .and_then(|_| validate_port(upstream.port))
                .map_err(|e| Error::validation_for_field(resource, &field, reason(&e)))?;
            if !upstream_names.insert(upstream.name.as_str()) {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.name"),
                    format!("duplicate upstream '{}'", upstream.name),
                ));
            }
        }

        let mut paths = HashSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            let field = format!("spec.routes[{i}]");
            route.validate(resource, &field)?;
            if !paths.insert(route.path.trim()) {
                return Err(Error::validation_for_field(
                    resource,
                    format!("{field}.path"),
                    format!("duplicate path '{}'", route.path),
                ));
            }
            if let Some(upstream) = route.action.upstream() {
                if !upstream_names.contains(upstream) {
                    return Err(Error::validation_for_field(
                        resource,
                        format!("{field}.action"),
                        format!("upstream '{upstream}' is not declared in spec.upstreams"),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_spec() -> VirtualServerSpec {
        serde_json::from_value(serde_json::json!({
            "host": "www.example.com",
            "tls": { "secret": "myapp-cert", "redirect": { "enable": true } },
            "policies": [{ "name": "ip-policy" }],
            "upstreams": [{ "name": "myapp", "service": "myapp-svc", "port": 80 }],
            "routes": [{ "path": "/app", "action": { "pass": "myapp" } }]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let spec = example_spec();
        assert_eq!(spec.policies[0].namespace, "nginx-ingress");
        let redirect = spec.tls.as_ref().unwrap().redirect.as_ref().unwrap();
        assert!(redirect.enable);
        assert_eq!(redirect.code, 301);
        assert!(spec.validate("example-server").is_ok());
    }

    #[test]
    fn return_action_uses_nginx_field_names() {
        let action: RouteAction = serde_json::from_value(serde_json::json!({
            "return": { "code": 403, "type": "text/plain", "body": "denied" }
        }))
        .unwrap();
        let ret = action.return_.as_ref().unwrap();
        assert_eq!(ret.code, 403);
        assert_eq!(ret.content_type.as_deref(), Some("text/plain"));

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["return"]["type"], "text/plain");
        assert!(value.get("pass").is_none());
    }

    #[test]
    fn proxy_rewrite_path_is_camel_case() {
        let action: RouteAction = serde_json::from_value(serde_json::json!({
            "proxy": { "upstream": "myapp", "rewritePath": "/" }
        }))
        .unwrap();
        assert_eq!(action.upstream(), Some("myapp"));
        assert_eq!(action.proxy.unwrap().rewrite_path.as_deref(), Some("/"));
    }

    #[test]
    fn route_must_use_declared_upstream() {
        let mut spec = example_spec();
        spec.routes[0].action.pass = Some("other".to_string());
        let err = spec.validate("example-server").unwrap_err();
        assert_eq!(err.field(), Some("spec.routes[0].action"));
        assert!(err.to_string().contains("'other'"));
    }

    #[test]
    fn action_must_set_exactly_one_variant() {
        let none = RouteAction::default();
        assert!(none.validate("r", "action").is_err());

        let two = RouteAction {
            pass: Some("myapp".to_string()),
            redirect: Some(ActionRedirect {
                url: "https://example.com".to_string(),
                code: 302,
            }),
            ..Default::default()
        };
        assert!(two.validate("r", "action").is_err());
    }

    #[test]
    fn redirect_codes_are_restricted() {
        let mut spec = example_spec();
        spec.tls.as_mut().unwrap().redirect.as_mut().unwrap().code = 303;
        let err = spec.validate("example-server").unwrap_err();
        assert_eq!(err.field(), Some("spec.tls.redirect.code"));
    }

    #[test]
    fn duplicate_upstreams_and_paths_are_rejected() {
        let mut spec = example_spec();
        spec.upstreams.push(spec.upstreams[0].clone());
        assert_eq!(
            spec.validate("s").unwrap_err().field(),
            Some("spec.upstreams[1].name")
        );

        let mut spec = example_spec();
        spec.routes.push(spec.routes[0].clone());
        assert_eq!(
            spec.validate("s").unwrap_err().field(),
            Some("spec.routes[1].path")
        );
    }

    #[test]
    fn bad_host_and_port_are_reported() {
        let mut spec = example_spec();
        spec.host = "Not A Host".to_string();
        assert_eq!(spec.validate("s").unwrap_err().field(), Some("spec.host"));

        let mut spec = example_spec();
        spec.upstreams[0].port = 0;
        assert_eq!(
            spec.validate("s").unwrap_err().field(),
            Some("spec.upstreams[0]")
        );
    }

    #[test]
    fn route_paths_accept_exact_and_regex() {
        let route = |path: &str| Route {
            path: path.to_string(),
            policies: Vec::new(),
            action: RouteAction {
                pass: Some("myapp".to_string()),
                ..Default::default()
            },
        };
        assert!(route("/").validate("s", "route").is_ok());
        assert!(route("=/exact").validate("s", "route").is_ok());
        assert!(route("~ ^/api").validate("s", "route").is_ok());
        assert!(route("app").validate("s", "route").is_err());
    }

    #[test]
    fn virtual_server_serializes_kind_and_group() {
        let vs = VirtualServer::new("example-server", example_spec());
        let value = serde_json::to_value(&vs).unwrap();
        assert_eq!(value["apiVersion"], "k8s.nginx.org/v1");
        assert_eq!(value["kind"], "VirtualServer");
        assert_eq!(value["spec"]["routes"][0]["action"]["pass"], "myapp");
    }
}
