//! IP access control policies (`/kubeapi/ipallow`, `/kubeapi/ipdeny`)
//!
//! Each gateway policy `<PolicyName>` is an NGINX `Policy` named
//! `<PolicyName>-ip-allow` or `<PolicyName>-ip-deny` in the policy namespace,
//! labelled `type=ip-allow|ip-deny`. The requested apply range is kept in an
//! annotation on the object.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use apim_common::crd::{ApplyRange, IpRuleKind, Policy, ResourceState};
use apim_common::validation::{normalize_ip_sources, validate_resource_name};
use apim_common::APPLY_RANGE_ANNOTATION;

use super::{Data, Message};
use crate::error::{Error, Result};
use crate::server::AppState;

/// Binds a set of handlers to one [`IpRuleKind`]
pub trait IpRule: Send + Sync + 'static {
    /// Rule kind served
    const KIND: IpRuleKind;
    /// Name of the IP list in request bodies, used in error paths
    const IPS_FIELD: &'static str;
    /// List name of the opposite kind, refused in request bodies
    const OTHER_FIELD: &'static str;
}

/// `/kubeapi/ipallow`
pub struct Allow;

/// `/kubeapi/ipdeny`
pub struct Deny;

impl IpRule for Allow {
    const KIND: IpRuleKind = IpRuleKind::Allow;
    const IPS_FIELD: &'static str = "AllowIP";
    const OTHER_FIELD: &'static str = "DenyIP";
}

impl IpRule for Deny {
    const KIND: IpRuleKind = IpRuleKind::Deny;
    const IPS_FIELD: &'static str = "DenyIP";
    const OTHER_FIELD: &'static str = "AllowIP";
}

/// Body of a create request
#[derive(Debug, Deserialize)]
pub struct CreateIpPolicy {
    /// Gateway policy name; the object name gets the rule suffix
    #[serde(rename = "PolicyName")]
    pub policy_name: String,
    /// Addresses or CIDR blocks to allow (`/kubeapi/ipallow` only)
    #[serde(rename = "AllowIP", default)]
    pub allow_ip: Option<Vec<String>>,
    /// Addresses or CIDR blocks to deny (`/kubeapi/ipdeny` only)
    #[serde(rename = "DenyIP", default)]
    pub deny_ip: Option<Vec<String>>,
    /// `http`, `server` or `location` (legacy `all`, `servers`, `routes`)
    #[serde(rename = "ApplyRange", default)]
    pub apply_range: Option<String>,
}

/// Body of an update request
#[derive(Debug, Deserialize)]
pub struct UpdateIpPolicy {
    /// Replacement allow list (`/kubeapi/ipallow` only)
    #[serde(rename = "AllowIP", default)]
    pub allow_ip: Option<Vec<String>>,
    /// Replacement deny list (`/kubeapi/ipdeny` only)
    #[serde(rename = "DenyIP", default)]
    pub deny_ip: Option<Vec<String>>,
    /// New apply range; unchanged when absent
    #[serde(rename = "ApplyRange", default)]
    pub apply_range: Option<String>,
}

/// A policy as the gateway reports it
#[derive(Debug, Serialize)]
pub struct IpPolicyItem {
    /// Kubernetes UID
    pub uid: Option<String>,
    /// Gateway policy name
    pub name: String,
    /// Kubernetes object name
    pub resource_name: String,
    /// Addresses or CIDR blocks
    pub ips: Vec<String>,
    /// Where the policy is meant to be attached
    pub apply_range: ApplyRange,
    /// State reported by the ingress controller
    pub state: ResourceState,
    /// Controller message, if any
    pub message: Option<String>,
}

impl IpPolicyItem {
    fn from_policy(kind: IpRuleKind, policy: &Policy) -> Self {
        let resource_name = policy.name_any();
        Self {
            uid: policy.uid(),
            name: kind.policy_name(&resource_name),
            resource_name,
            ips: policy.ip_sources().to_vec(),
            apply_range: policy.apply_range(),
            state: policy.state(),
            message: policy.status.as_ref().and_then(|s| s.message.clone()),
        }
    }
}

fn resource_name<R: IpRule>(policy_name: &str) -> Result<String> {
    if policy_name.trim().is_empty() {
        return Err(Error::BadRequest("PolicyName must not be empty".to_string()));
    }
    let resource_name = R::KIND.resource_name(policy_name);
    validate_resource_name(&resource_name)?;
    Ok(resource_name)
}

/// The body's list for this kind, normalized; the other kind's list is refused
fn sources<R: IpRule>(
    resource_name: &str,
    allow_ip: Option<Vec<String>>,
    deny_ip: Option<Vec<String>>,
) -> Result<Vec<String>> {
    let (own, other) = match R::KIND {
        IpRuleKind::Allow => (allow_ip, deny_ip),
        IpRuleKind::Deny => (deny_ip, allow_ip),
    };
    if other.is_some() {
        return Err(Error::BadRequest(format!(
            "{} is not accepted by {} policies; send {}",
            R::OTHER_FIELD,
            R::KIND,
            R::IPS_FIELD
        )));
    }
    let ips = own.ok_or_else(|| Error::BadRequest(format!("missing field `{}`", R::IPS_FIELD)))?;
    Ok(normalize_ip_sources(resource_name, R::IPS_FIELD, &ips)?)
}

fn parse_apply_range(value: Option<&str>) -> Result<Option<ApplyRange>> {
    Ok(value.map(str::parse::<ApplyRange>).transpose()?)
}

/// List all policies of the kind
pub async fn list<R: IpRule>(
    State(state): State<AppState>,
) -> Result<Json<Data<Vec<IpPolicyItem>>>> {
    let policies = state
        .cluster
        .list_policies(&state.policy_namespace, &R::KIND.label_selector())
        .await?;

    let items = policies
        .iter()
        .map(|p| IpPolicyItem::from_policy(R::KIND, p))
        .collect();
    Ok(Json(Data::new(items)))
}

/// Get one policy by gateway name
pub async fn get<R: IpRule>(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Data<IpPolicyItem>>> {
    let resource_name = resource_name::<R>(&name)?;
    let policy = state
        .cluster
        .get_policy(&state.policy_namespace, &resource_name)
        .await?;

    if policy.ip_rule_kind() != Some(R::KIND) {
        return Err(Error::NotFound(format!("{} policy '{}'", R::KIND, name)));
    }
    Ok(Json(Data::new(IpPolicyItem::from_policy(R::KIND, &policy))))
}

/// Create a policy
pub async fn create<R: IpRule>(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateIpPolicy>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>)> {
    let Json(req) = body?;
    let resource_name = resource_name::<R>(&req.policy_name)?;
    let sources = sources::<R>(&resource_name, req.allow_ip, req.deny_ip)?;
    let apply_range = parse_apply_range(req.apply_range.as_deref())?.unwrap_or_default();

    let policy = Policy::ip_rule(
        R::KIND,
        &req.policy_name,
        &state.policy_namespace,
        sources,
        apply_range,
    );
    policy.validate()?;

    let created = state
        .cluster
        .create_policy(&state.policy_namespace, policy)
        .await?;

    info!(
        kind = %R::KIND,
        policy = %resource_name,
        namespace = %state.policy_namespace,
        apply_range = %apply_range,
        "Created IP policy"
    );

    Ok((
        StatusCode::CREATED,
        Json(
            Message::new(format!("{} policy '{}' created", R::KIND, req.policy_name))
                .with_uid(created.uid()),
        ),
    ))
}

/// Replace the address list (and optionally the apply range) of a policy
pub async fn update<R: IpRule>(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: std::result::Result<Json<UpdateIpPolicy>, JsonRejection>,
) -> Result<Json<Message>> {
    let Json(req) = body?;
    let resource_name = resource_name::<R>(&name)?;
    let sources = sources::<R>(&resource_name, req.allow_ip, req.deny_ip)?;
    let apply_range = parse_apply_range(req.apply_range.as_deref())?;

    let patch = merge_patch(R::KIND, sources, apply_range);
    let updated = state
        .cluster
        .patch_policy(&state.policy_namespace, &resource_name, patch)
        .await?;

    info!(
        kind = %R::KIND,
        policy = %resource_name,
        namespace = %state.policy_namespace,
        "Updated IP policy"
    );

    Ok(Json(
        Message::new(format!("{} policy '{}' updated", R::KIND, name)).with_uid(updated.uid()),
    ))
}

/// Delete a policy
pub async fn delete<R: IpRule>(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Message>> {
    let resource_name = resource_name::<R>(&name)?;
    state
        .cluster
        .delete_policy(&state.policy_namespace, &resource_name)
        .await?;

    info!(
        kind = %R::KIND,
        policy = %resource_name,
        namespace = %state.policy_namespace,
        "Deleted IP policy"
    );

    Ok(Json(Message::new(format!(
        "{} policy '{}' deleted",
        R::KIND,
        name
    ))))
}

/// JSON merge patch replacing the active list; the other list is nulled
fn merge_patch(
    kind: IpRuleKind,
    sources: Vec<String>,
    apply_range: Option<ApplyRange>,
) -> serde_json::Value {
    let access_control = match kind {
        IpRuleKind::Allow => serde_json::json!({ "allow": sources, "deny": null }),
        IpRuleKind::Deny => serde_json::json!({ "deny": sources, "allow": null }),
    };

    let mut patch = serde_json::json!({ "spec": { "accessControl": access_control } });
    if let Some(range) = apply_range {
        patch["metadata"] = serde_json::json!({
            "annotations": { APPLY_RANGE_ANNOTATION: range.as_str() }
        });
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::handlers::test_support::{api_error, send, POLICY_NAMESPACE};
    use apim_common::crd::PolicyStatus;
    use serde_json::json;

    fn stored(kind: IpRuleKind, name: &str, ips: &[&str], range: ApplyRange) -> Policy {
        let mut policy = Policy::ip_rule(
            kind,
            name,
            POLICY_NAMESPACE,
            ips.iter().map(|s| s.to_string()).collect(),
            range,
        );
        policy.metadata.uid = Some(format!("uid-{name}"));
        policy.status = Some(PolicyStatus {
            state: ResourceState::Valid,
            reason: Some("AddedOrUpdated".to_string()),
            message: Some(format!("Policy nginx-ingress/{} was added or updated", kind.resource_name(name))),
        });
        policy
    }

    #[tokio::test]
    async fn list_uses_label_selector_and_reports_items() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_policies()
            .withf(|ns, selector| ns == POLICY_NAMESPACE && selector == "type=ip-allow")
            .returning(|_, _| {
                Ok(vec![stored(
                    IpRuleKind::Allow,
                    "test",
                    &["192.168.201.1", "192.22.22.1"],
                    ApplyRange::Server,
                )])
            });

        let (status, body) = send(mock, "GET", "/kubeapi/ipallow", None).await;

        assert_eq!(status, StatusCode::OK);
        let item = &body["data"][0];
        assert_eq!(item["name"], "test");
        assert_eq!(item["resource_name"], "test-ip-allow");
        assert_eq!(item["uid"], "uid-test");
        assert_eq!(item["ips"], json!(["192.168.201.1", "192.22.22.1"]));
        assert_eq!(item["apply_range"], "server");
        assert_eq!(item["state"], "Valid");
    }

    #[tokio::test]
    async fn deny_list_uses_deny_selector() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_policies()
            .withf(|_, selector| selector == "type=ip-deny")
            .returning(|_, _| Ok(Vec::new()));

        let (status, body) = send(mock, "GET", "/kubeapi/ipdeny", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "data": [] }));
    }

    #[tokio::test]
    async fn get_missing_policy_is_404() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_policy()
            .withf(|_, name| name == "ghost-ip-allow")
            .returning(|_, _| Err(api_error(404, "NotFound")));

        let (status, body) = send(mock, "GET", "/kubeapi/ipallow/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn get_rejects_policy_of_other_kind() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_policy().returning(|_, _| {
            let mut policy = stored(IpRuleKind::Allow, "edge", &["10.0.0.1"], ApplyRange::Http);
            policy.metadata.labels = None;
            Ok(policy)
        });

        let (status, _) = send(mock, "GET", "/kubeapi/ipallow/edge", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_builds_labelled_policy() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_policy()
            .withf(|ns, policy| {
                ns == POLICY_NAMESPACE
                    && policy.name_any() == "office-ip-allow"
                    && policy.ip_rule_kind() == Some(IpRuleKind::Allow)
                    && policy.apply_range() == ApplyRange::Server
                    && policy.ip_sources() == ["192.168.201.1", "10.0.0.0/8"]
            })
            .returning(|_, mut policy| {
                policy.metadata.uid = Some("new-uid".to_string());
                Ok(policy)
            });

        let (status, body) = send(
            mock,
            "POST",
            "/kubeapi/ipallow",
            Some(json!({
                "PolicyName": "office",
                "AllowIP": ["192.168.201.1", "10.0.0.0/8", "192.168.201.1"],
                "ApplyRange": "servers"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["uid"], "new-uid");
        assert_eq!(body["message"], "ip-allow policy 'office' created");
    }

    #[tokio::test]
    async fn create_deny_accepts_deny_field() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_policy()
            .withf(|_, policy| {
                policy.name_any() == "scanner-ip-deny"
                    && policy.spec.access_control.as_ref().map(|ac| ac.deny.len()) == Some(1)
            })
            .returning(|_, policy| Ok(policy));

        let (status, _) = send(
            mock,
            "POST",
            "/kubeapi/ipdeny",
            Some(json!({ "PolicyName": "scanner", "DenyIP": ["203.0.113.0/24"], "ApplyRange": "http" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn allow_endpoint_refuses_deny_list() {
        let (status, body) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "PolicyName": "block", "DenyIP": ["203.0.113.7"] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("DenyIP"));
    }

    #[tokio::test]
    async fn deny_endpoint_refuses_allow_list() {
        let (status, body) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipdeny",
            Some(json!({ "PolicyName": "open", "AllowIP": ["0.0.0.0/0"] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("AllowIP"));
    }

    #[tokio::test]
    async fn update_refuses_both_lists() {
        let (status, _) = send(
            MockClusterApi::new(),
            "PUT",
            "/kubeapi/ipallow/office",
            Some(json!({ "AllowIP": ["10.0.0.1"], "DenyIP": ["10.0.0.2"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            MockClusterApi::new(),
            "PUT",
            "/kubeapi/ipdeny/edge",
            Some(json!({ "ApplyRange": "http" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("DenyIP"));
    }

    #[tokio::test]
    async fn create_rejects_bad_ip_without_calling_cluster() {
        let (status, body) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "PolicyName": "office", "AllowIP": ["10.0.0.1", "10.0.0.300"] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("AllowIP[1]"));
    }

    #[tokio::test]
    async fn create_rejects_empty_list_and_bad_range() {
        let (status, _) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "PolicyName": "office", "AllowIP": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "PolicyName": "office", "AllowIP": ["10.0.0.1"], "ApplyRange": "zone" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_rejects_malformed_body() {
        let (status, body) = send(
            MockClusterApi::new(),
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "AllowIP": ["10.0.0.1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "Status");
    }

    #[tokio::test]
    async fn create_duplicate_is_409() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_policy()
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let (status, _) = send(
            mock,
            "POST",
            "/kubeapi/ipallow",
            Some(json!({ "PolicyName": "office", "AllowIP": ["10.0.0.1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn update_merge_patches_list_and_range() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_policy()
            .withf(|ns, name, patch| {
                ns == POLICY_NAMESPACE
                    && name == "office-ip-allow"
                    && patch["spec"]["accessControl"]["allow"] == json!(["10.1.1.1"])
                    && patch["spec"]["accessControl"]["deny"].is_null()
                    && patch["metadata"]["annotations"][APPLY_RANGE_ANNOTATION] == "location"
            })
            .returning(|_, _, _| {
                Ok(stored(IpRuleKind::Allow, "office", &["10.1.1.1"], ApplyRange::Location))
            });

        let (status, body) = send(
            mock,
            "PUT",
            "/kubeapi/ipallow/office",
            Some(json!({ "AllowIP": ["10.1.1.1"], "ApplyRange": "routes" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uid"], "uid-office");
    }

    #[tokio::test]
    async fn update_without_range_leaves_annotation() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_policy()
            .withf(|_, _, patch| patch.get("metadata").is_none())
            .returning(|_, _, _| {
                Ok(stored(IpRuleKind::Deny, "edge", &["10.1.1.1"], ApplyRange::Http))
            });

        let (status, _) = send(
            mock,
            "PUT",
            "/kubeapi/ipdeny/edge",
            Some(json!({ "DenyIP": ["10.1.1.1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn update_missing_policy_is_404() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_policy()
            .returning(|_, _, _| Err(api_error(404, "NotFound")));

        let (status, _) = send(
            mock,
            "PUT",
            "/kubeapi/ipallow/ghost",
            Some(json!({ "AllowIP": ["10.1.1.1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_targets_suffixed_object() {
        let mut mock = MockClusterApi::new();
        mock.expect_delete_policy()
            .withf(|ns, name| ns == POLICY_NAMESPACE && name == "office-ip-deny")
            .returning(|_, _| Ok(()));

        let (status, body) = send(mock, "DELETE", "/kubeapi/ipdeny/office", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "ip-deny policy 'office' deleted");
    }

    #[tokio::test]
    async fn cluster_outage_is_502() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_policies().returning(|_, _| {
            Err(kube::Error::SerdeError(
                serde_json::from_str::<u8>("x").unwrap_err(),
            ))
        });

        let (status, _) = send(mock, "GET", "/kubeapi/ipallow", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
