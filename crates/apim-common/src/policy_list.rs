//! `PolicyList` envelope parsing and schema validation
//!
//! A list response from `GET /apis/k8s.nginx.org/v1/namespaces/{ns}/policies`
//! (or the gateway's own `{"data": ...}` wrapped variant) is checked for the
//! right kind and apiVersion, then every item is deserialized and validated.
//! Errors name the offending field path, e.g. `items[1].spec.accessControl.allow[0]`.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crd::{Policy, ResourceState};
use crate::{Error, NGINX_API_VERSION};

/// Kind of the list envelope
pub const POLICY_LIST_KIND: &str = "PolicyList";

/// Kind of every item
pub const POLICY_KIND: &str = "Policy";

const RESOURCE: &str = "PolicyList";

/// A page of `Policy` objects as returned by the API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyList {
    /// Always `k8s.nginx.org/v1`
    pub api_version: String,
    /// Always `PolicyList`
    pub kind: String,
    /// List metadata: resourceVersion and the pagination cursor
    #[serde(default)]
    pub metadata: ListMeta,
    /// Policies in API server order
    #[serde(default)]
    pub items: Vec<Policy>,
}

impl PolicyList {
    /// Wrap items into a list envelope
    pub fn new(items: Vec<Policy>, metadata: ListMeta) -> Self {
        Self {
            api_version: NGINX_API_VERSION.to_string(),
            kind: POLICY_LIST_KIND.to_string(),
            metadata,
            items,
        }
    }

    /// Pagination cursor for the next page, if there is one
    pub fn continue_token(&self) -> Option<&str> {
        self.metadata
            .continue_
            .as_deref()
            .filter(|token| !token.is_empty())
    }

    /// Whether the API server has further pages; an empty cursor means no
    pub fn has_more(&self) -> bool {
        self.continue_token().is_some()
    }

    /// resourceVersion the list was served at
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Policies the ingress controller reported as `Valid`
    pub fn valid_items(&self) -> impl Iterator<Item = &Policy> {
        self.items
            .iter()
            .filter(|p| p.state() == ResourceState::Valid)
    }

    /// Field managers that own fields on any item (server-side apply bookkeeping)
    pub fn field_managers(&self) -> BTreeSet<&str> {
        self.items
            .iter()
            .filter_map(|p| p.metadata.managed_fields.as_ref())
            .flatten()
            .filter_map(|entry| entry.manager.as_deref())
            .collect()
    }
}

/// Parse and validate a `PolicyList` document
pub fn parse_policy_list(json: &str) -> Result<PolicyList, Error> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::serialization(POLICY_LIST_KIND, e.to_string()))?;
    policy_list_from_value(value)
}

/// Validate an already parsed `PolicyList` document
pub fn policy_list_from_value(value: Value) -> Result<PolicyList, Error> {
    let mut value = unwrap_envelope(value);
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::validation_for(RESOURCE, "document is not a JSON object"))?;

    expect_str(object.get("kind"), "kind", POLICY_LIST_KIND)?;
    expect_str(object.get("apiVersion"), "apiVersion", NGINX_API_VERSION)?;

    let metadata: ListMeta = match object.remove("metadata") {
        Some(meta) => serde_json::from_value(meta).map_err(|e| {
            Error::validation_for_field(RESOURCE, "metadata", e.to_string())
        })?,
        None => ListMeta::default(),
    };

    let raw_items = match object.remove("items") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(Error::validation_for_field(
                RESOURCE,
                "items",
                "items must be an array",
            ))
        }
    };

    let items = raw_items
        .into_iter()
        .enumerate()
        .map(|(i, item)| parse_item(i, item))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PolicyList::new(items, metadata))
}

/// The gateway answers list calls as `{"data": <PolicyList>}`
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if !map.contains_key("kind") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn expect_str(actual: Option<&Value>, field: &str, expected: &str) -> Result<(), Error> {
    match actual.and_then(Value::as_str) {
        Some(value) if value == expected => Ok(()),
        Some(value) => Err(Error::validation_for_field(
            RESOURCE,
            field,
            format!("expected '{expected}', found '{value}'"),
        )),
        None => Err(Error::validation_for_field(
            RESOURCE,
            field,
            format!("missing, expected '{expected}'"),
        )),
    }
}

fn parse_item(index: usize, item: Value) -> Result<Policy, Error> {
    let prefix = format!("items[{index}]");

    // Items of a typed list may omit kind/apiVersion, but must not contradict them
    if let Some(kind) = item.get("kind") {
        expect_str(Some(kind), &format!("{prefix}.kind"), POLICY_KIND)?;
    }
    if let Some(api_version) = item.get("apiVersion") {
        expect_str(Some(api_version), &format!("{prefix}.apiVersion"), NGINX_API_VERSION)?;
    }

    let policy: Policy = serde_json::from_value(item)
        .map_err(|e| Error::validation_for_field(RESOURCE, &prefix, e.to_string()))?;

    let name = policy.name_any();
    if name.is_empty() {
        return Err(Error::validation_for_field(
            RESOURCE,
            format!("{prefix}.metadata.name"),
            "name is required",
        ));
    }

    for (j, entry) in policy
        .metadata
        .managed_fields
        .iter()
        .flatten()
        .enumerate()
    {
        let field = format!("{prefix}.metadata.managedFields[{j}]");
        if entry.manager.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::validation_for_field(&name, &field, "manager is required"));
        }
        match entry.operation.as_deref() {
            Some("Apply") | Some("Update") => {}
            other => {
                return Err(Error::validation_for_field(
                    &name,
                    &field,
                    format!("operation must be Apply or Update, found {other:?}"),
                ))
            }
        }
    }

    policy
        .validate()
        .map_err(|e| prefix_field(e, &prefix))?;

    Ok(policy)
}

fn prefix_field(err: Error, prefix: &str) -> Error {
    match err {
        Error::Validation {
            resource,
            message,
            field,
        } => Error::Validation {
            resource,
            message,
            field: Some(match field {
                Some(field) => format!("{prefix}.{field}"),
                None => prefix.to_string(),
            }),
        },
        other => other,
    }
}
