//! HTTP handlers for the `/kubeapi` surface
//!
//! List endpoints answer `{"data": [...]}`; mutations answer
//! `{"message": "..."}`. Errors are Kubernetes `Status` objects.

pub mod certs;
pub mod ip_policy;
pub mod routes;
pub mod servers;
pub mod upstreams;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use apim_common::client::is_conflict;

use crate::error::{Error, Result};

/// Envelope for list and get responses
#[derive(Debug, Serialize)]
pub struct Data<T> {
    /// Payload
    pub data: T,
}

impl<T> Data<T> {
    /// Wrap a payload
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Body of a successful mutation
#[derive(Debug, Serialize)]
pub struct Message {
    /// Human-readable outcome
    pub message: String,
    /// UID of the created or updated object, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl Message {
    /// Outcome without an object UID
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            uid: None,
        }
    }

    /// Attach the UID of the affected object
    pub fn with_uid(mut self, uid: Option<String>) -> Self {
        self.uid = uid;
        self
    }
}

/// `?name=` (and optional `&namespace=`) query for delete endpoints
#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    /// Object name
    pub name: String,
    /// Restrict the search to one namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Optional `?namespace=` query for update endpoints
#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    /// Restrict the search to one namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Pick the one object named `name` out of a cluster-wide listing
///
/// The same name in several namespaces is a conflict the caller resolves
/// with `?namespace=`.
pub(crate) fn single_match<'a, K: ResourceExt>(
    what: &str,
    name: &str,
    objects: &'a [K],
) -> Result<&'a K> {
    let matches: Vec<&K> = objects.iter().filter(|obj| obj.name_any() == name).collect();

    match matches.as_slice() {
        [] => Err(Error::NotFound(format!("{what} '{name}'"))),
        [one] => Ok(*one),
        _ => {
            let namespaces: Vec<String> = matches.iter().filter_map(|obj| obj.namespace()).collect();
            Err(Error::Conflict(format!(
                "{what} '{name}' exists in namespaces {}; pass ?namespace=",
                namespaces.join(", ")
            )))
        }
    }
}

/// Error for a failed read-modify-write replace
///
/// A 409 there means `resourceVersion` went stale between the read and the
/// write; the caller can simply repeat the request.
pub(crate) fn replace_error(what: &str, name: &str, err: kube::Error) -> Error {
    if is_conflict(&err) {
        Error::Conflict(format!(
            "{what} '{name}' was modified since it was read; retry the update"
        ))
    } else {
        err.into()
    }
}
