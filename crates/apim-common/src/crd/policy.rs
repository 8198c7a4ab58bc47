//! NGINX `Policy` CRD (`k8s.nginx.org/v1`) with IP access control
//!
//! The gateway only manages access control policies. Other policy kinds the
//! NGINX Ingress Controller supports (rate limiting, JWT, OIDC, ...) are left
//! untouched when listed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::api::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceState;
use crate::validation::{parse_ip_source, reason};
use crate::{Error, APPLY_RANGE_ANNOTATION, POLICY_TYPE_LABEL};

/// Policy attaches behaviour to NGINX virtual servers and routes.
///
/// Example:
/// ```yaml
/// apiVersion: k8s.nginx.org/v1
/// kind: Policy
/// metadata:
///   name: office-ip-allow
///   namespace: nginx-ingress
///   labels:
///     type: ip-allow
/// spec:
///   accessControl:
///     allow:
///       - 192.168.201.1
///       - 10.0.0.0/8
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "Policy",
    namespaced,
    status = "PolicyStatus",
    shortname = "pol",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// IP based access control
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<AccessControl>,
}

/// Allow or deny lists of IP addresses / CIDR blocks.
///
/// Exactly one of the two lists is set on a valid policy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControl {
    /// Sources allowed; everything else is denied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,

    /// Sources denied; everything else is allowed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl AccessControl {
    /// Validate the lists, reporting the first bad entry by field path
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        const PREFIX: &str = "spec.accessControl";

        match (self.allow.is_empty(), self.deny.is_empty()) {
            (true, true) => {
                return Err(Error::validation_for_field(
                    resource,
                    PREFIX,
                    "one of allow or deny must be set",
                ))
            }
            (false, false) => {
                return Err(Error::validation_for_field(
                    resource,
                    PREFIX,
                    "allow and deny are mutually exclusive",
                ))
            }
            _ => {}
        }

        let (list, entries) = if self.allow.is_empty() {
            ("deny", &self.deny)
        } else {
            ("allow", &self.allow)
        };

        for (i, entry) in entries.iter().enumerate() {
            parse_ip_source(entry).map_err(|e| {
                Error::validation_for_field(resource, format!("{PREFIX}.{list}[{i}]"), reason(&e))
            })?;
        }
        Ok(())
    }

    /// Which rule kind this access control expresses, if it is well formed
    pub fn kind(&self) -> Option<IpRuleKind> {
        match (self.allow.is_empty(), self.deny.is_empty()) {
            (false, true) => Some(IpRuleKind::Allow),
            (true, false) => Some(IpRuleKind::Deny),
            _ => None,
        }
    }

    /// Sources of the active list
    pub fn sources(&self) -> &[String] {
        if self.allow.is_empty() {
            &self.deny
        } else {
            &self.allow
        }
    }
}

/// Policy status reported by the NGINX Ingress Controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Whether the controller accepted the policy
    #[serde(default)]
    pub state: ResourceState,

    /// Machine-readable reason, e.g. `AddedOrUpdated`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Flavour of an IP access control policy managed by the gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpRuleKind {
    /// `spec.accessControl.allow`
    Allow,
    /// `spec.accessControl.deny`
    Deny,
}

impl IpRuleKind {
    /// Value of the `type` label on policies of this kind
    pub fn label_value(self) -> &'static str {
        match self {
            IpRuleKind::Allow => "ip-allow",
            IpRuleKind::Deny => "ip-deny",
        }
    }

    /// Label selector listing policies of this kind
    pub fn label_selector(self) -> String {
        format!("{}={}", POLICY_TYPE_LABEL, self.label_value())
    }

    /// Kubernetes object name for a user facing policy name
    pub fn resource_name(self, policy_name: &str) -> String {
        format!("{}-{}", policy_name, self.label_value())
    }

    /// User facing policy name for a Kubernetes object name
    pub fn policy_name(self, resource_name: &str) -> String {
        resource_name
            .strip_suffix(&format!("-{}", self.label_value()))
            .unwrap_or(resource_name)
            .to_string()
    }

    /// Build the access control block for the given sources
    pub fn access_control(self, sources: Vec<String>) -> AccessControl {
        match self {
            IpRuleKind::Allow => AccessControl {
                allow: sources,
                deny: Vec::new(),
            },
            IpRuleKind::Deny => AccessControl {
                allow: Vec::new(),
                deny: sources,
            },
        }
    }
}

impl fmt::Display for IpRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

/// Where an IP access control policy is meant to be attached
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApplyRange {
    /// Whole `http` context
    #[default]
    #[serde(alias = "all")]
    Http,
    /// A virtual server
    #[serde(alias = "servers")]
    Server,
    /// A single route
    #[serde(alias = "routes")]
    Location,
}

impl ApplyRange {
    /// Wire representation
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyRange::Http => "http",
            ApplyRange::Server => "server",
            ApplyRange::Location => "location",
        }
    }
}

impl fmt::Display for ApplyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplyRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "all" => Ok(ApplyRange::Http),
            "server" | "servers" => Ok(ApplyRange::Server),
            "location" | "routes" => Ok(ApplyRange::Location),
            other => Err(Error::validation(format!("unknown apply range '{other}'"))),
        }
    }
}

impl Policy {
    /// Build an IP access control policy as the gateway stores it
    pub fn ip_rule(
        kind: IpRuleKind,
        policy_name: &str,
        namespace: &str,
        sources: Vec<String>,
        apply_range: ApplyRange,
    ) -> Self {
        let metadata = ObjectMeta {
            name: Some(kind.resource_name(policy_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                POLICY_TYPE_LABEL.to_string(),
                kind.label_value().to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                APPLY_RANGE_ANNOTATION.to_string(),
                apply_range.to_string(),
            )])),
            ..Default::default()
        };

        Policy {
            metadata,
            spec: PolicySpec {
                access_control: Some(kind.access_control(sources)),
            },
            status: None,
        }
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), Error> {
        let name = self.name_any();
        match &self.spec.access_control {
            Some(ac) => ac.validate(&name),
            None => Ok(()),
        }
    }

    /// Rule kind from the `type` label
    pub fn ip_rule_kind(&self) -> Option<IpRuleKind> {
        match self.labels().get(POLICY_TYPE_LABEL).map(String::as_str) {
            Some("ip-allow") => Some(IpRuleKind::Allow),
            Some("ip-deny") => Some(IpRuleKind::Deny),
            _ => None,
        }
    }

    /// Apply range from the annotation; policies created elsewhere default to `http`
    pub fn apply_range(&self) -> ApplyRange {
        self.annotations()
            .get(APPLY_RANGE_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Sources of the access control list, empty for other policy kinds
    pub fn ip_sources(&self) -> &[String] {
        self.spec
            .access_control
            .as_ref()
            .map(AccessControl::sources)
            .unwrap_or(&[])
    }

    /// Controller reported state, `Unknown` until the status is populated
    pub fn state(&self) -> ResourceState {
        self.status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }
}
