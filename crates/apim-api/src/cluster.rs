//! Access to the Kubernetes API
//!
//! Handlers never talk to `kube` directly; they go through [`ClusterApi`] so
//! tests can inject a mock. [`KubeClusterApi`] is the production
//! implementation backed by typed `kube::Api`s.
//!
//! List calls walk every page (`continue` token) and retry transient API
//! server failures. Mutations are attempted once: the API server's answer
//! (409, 422, ...) is what the HTTP caller needs to see.

use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::core::PartialObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use apim_common::crd::{Policy, VirtualServer};
use apim_common::error::is_transient_kube_error;
use apim_common::retry::{retry_transient, Backoff};
use apim_common::TLS_SECRET_TYPE;

/// Page size for list calls
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Where a list call looks
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Every namespace
    Cluster,
    /// A single namespace
    Namespace(String),
}

impl Scope {
    /// Scope from an optional namespace path parameter
    pub fn from_namespace(namespace: Option<String>) -> Self {
        match namespace {
            Some(ns) => Scope::Namespace(ns),
            None => Scope::Cluster,
        }
    }
}

/// Operations the gateway performs against the Kubernetes API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List NGINX policies in a namespace matching a label selector
    async fn list_policies(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Policy>, kube::Error>;

    /// Get a single NGINX policy
    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Policy, kube::Error>;

    /// Create an NGINX policy
    async fn create_policy(&self, namespace: &str, policy: Policy) -> Result<Policy, kube::Error>;

    /// JSON merge-patch an NGINX policy
    async fn patch_policy(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<Policy, kube::Error>;

    /// Delete an NGINX policy
    async fn delete_policy(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// List VirtualServers
    async fn list_virtual_servers(&self, scope: Scope) -> Result<Vec<VirtualServer>, kube::Error>;

    /// Create a VirtualServer
    async fn create_virtual_server(
        &self,
        namespace: &str,
        server: VirtualServer,
    ) -> Result<VirtualServer, kube::Error>;

    /// Replace a VirtualServer; `metadata.resourceVersion` guards the write
    async fn replace_virtual_server(
        &self,
        namespace: &str,
        server: VirtualServer,
    ) -> Result<VirtualServer, kube::Error>;

    /// Delete a VirtualServer
    async fn delete_virtual_server(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// List Services, optionally filtered by a label selector
    async fn list_services(
        &self,
        scope: Scope,
        label_selector: Option<String>,
    ) -> Result<Vec<Service>, kube::Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: Service)
        -> Result<Service, kube::Error>;

    /// Replace a Service; `metadata.resourceVersion` guards the write
    async fn replace_service(
        &self,
        namespace: &str,
        service: Service,
    ) -> Result<Service, kube::Error>;

    /// Delete a Service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Get an Endpoints object
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints, kube::Error>;

    /// Create an Endpoints object
    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: Endpoints,
    ) -> Result<Endpoints, kube::Error>;

    /// Replace an Endpoints object; `metadata.resourceVersion` guards the write
    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: Endpoints,
    ) -> Result<Endpoints, kube::Error>;

    /// Delete an Endpoints object
    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// List metadata of Secrets of type `kubernetes.io/tls`; key material is not fetched
    async fn list_tls_secrets(
        &self,
        scope: Scope,
    ) -> Result<Vec<PartialObjectMeta<Secret>>, kube::Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret, kube::Error>;

    /// Delete a Secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// [`ClusterApi`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    backoff: Backoff,
    page_size: u32,
}

impl KubeClusterApi {
    /// Wrap a client with the default page size and retry schedule
    pub fn new(client: Client) -> Self {
        Self {
            client,
            backoff: Backoff::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the retry schedule for list calls
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the list page size
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped<K>(&self, scope: &Scope) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match scope {
            Scope::Cluster => Api::all(self.client.clone()),
            Scope::Namespace(ns) => self.namespaced(ns),
        }
    }

    /// Collect every page of a list call
    async fn list_all<K>(
        &self,
        api: &Api<K>,
        operation: &str,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<K>, kube::Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        self.list_pages(operation, label_selector, field_selector, move |params| async move {
            api.list(&params).await
        })
        .await
    }

    /// Follow `continue` tokens until the server reports no further pages
    ///
    /// Each page is retried on its own; a transient failure on page N does
    /// not refetch pages before it.
    async fn list_pages<T, F, Fut>(
        &self,
        operation: &str,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
        fetch: F,
    ) -> Result<Vec<T>, kube::Error>
    where
        T: Clone,
        F: Fn(ListParams) -> Fut,
        Fut: Future<Output = Result<ObjectList<T>, kube::Error>>,
    {
        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = ListParams::default().limit(self.page_size);
            if let Some(labels) = label_selector {
                params = params.labels(labels);
            }
            if let Some(fields) = field_selector {
                params = params.fields(fields);
            }
            if let Some(token) = &continue_token {
                params = params.continue_token(token);
            }

            let page = retry_transient(&self.backoff, operation, is_transient_kube_error, || {
                fetch(params.clone())
            })
            .await?;

            items.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        debug!(operation = %operation, count = items.len(), "Listed resources");
        Ok(items)
    }

    async fn replace<K>(&self, namespace: &str, object: K) -> Result<K, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + serde::Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = object.name_any();
        self.namespaced::<K>(namespace)
            .replace(&name, &PostParams::default(), &object)
            .await
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_policies(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Policy>, kube::Error> {
        let api = self.namespaced::<Policy>(namespace);
        self.list_all(&api, "list_policies", Some(label_selector), None)
            .await
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Policy, kube::Error> {
        self.namespaced::<Policy>(namespace).get(name).await
    }

    async fn create_policy(&self, namespace: &str, policy: Policy) -> Result<Policy, kube::Error> {
        self.namespaced::<Policy>(namespace)
            .create(&PostParams::default(), &policy)
            .await
    }

    async fn patch_policy(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<Policy, kube::Error> {
        self.namespaced::<Policy>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }

    async fn delete_policy(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.delete::<Policy>(namespace, name).await
    }

    async fn list_virtual_servers(&self, scope: Scope) -> Result<Vec<VirtualServer>, kube::Error> {
        let api = self.scoped::<VirtualServer>(&scope);
        self.list_all(&api, "list_virtual_servers", None, None).await
    }

    async fn create_virtual_server(
        &self,
        namespace: &str,
        server: VirtualServer,
    ) -> Result<VirtualServer, kube::Error> {
        self.namespaced::<VirtualServer>(namespace)
            .create(&PostParams::default(), &server)
            .await
    }

    async fn replace_virtual_server(
        &self,
        namespace: &str,
        server: VirtualServer,
    ) -> Result<VirtualServer, kube::Error> {
        self.replace(namespace, server).await
    }

    async fn delete_virtual_server(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.delete::<VirtualServer>(namespace, name).await
    }

    async fn list_services(
        &self,
        scope: Scope,
        label_selector: Option<String>,
    ) -> Result<Vec<Service>, kube::Error> {
        let api = self.scoped::<Service>(&scope);
        self.list_all(&api, "list_services", label_selector.as_deref(), None)
            .await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: Service,
    ) -> Result<Service, kube::Error> {
        self.namespaced::<Service>(namespace)
            .create(&PostParams::default(), &service)
            .await
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: Service,
    ) -> Result<Service, kube::Error> {
        self.replace(namespace, service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.delete::<Service>(namespace, name).await
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints, kube::Error> {
        self.namespaced::<Endpoints>(namespace).get(name).await
    }

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        self.namespaced::<Endpoints>(namespace)
            .create(&PostParams::default(), &endpoints)
            .await
    }

    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        self.replace(namespace, endpoints).await
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.delete::<Endpoints>(namespace, name).await
    }

    async fn list_tls_secrets(
        &self,
        scope: Scope,
    ) -> Result<Vec<PartialObjectMeta<Secret>>, kube::Error> {
        let api = &self.scoped::<Secret>(&scope);
        let selector = format!("type={TLS_SECRET_TYPE}");
        self.list_pages("list_tls_secrets", None, Some(&selector), move |params| async move {
            api.list_metadata(&params).await
        })
        .await
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret, kube::Error> {
        self.namespaced::<Secret>(namespace)
            .create(&PostParams::default(), &secret)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.delete::<Secret>(namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::http::{Request, Response};
    use kube::client::Body;
    use serde_json::{json, Value};

    /// Client whose API server answers with `responses` in order and records request URIs
    fn scripted_client(responses: Vec<(u16, Value)>) -> (Client, Arc<Mutex<Vec<String>>>) {
        let responses = Arc::new(Mutex::new(VecDeque::from(responses)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        let service = tower::service_fn(move |req: Request<Body>| {
            recorded.lock().unwrap().push(req.uri().to_string());
            let (status, body) = responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra request");
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                )
            }
        });

        (Client::new(service, "default"), seen)
    }

    fn fast_backoff() -> Backoff {
        Backoff {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn service_page(names: &[&str], continue_token: Option<&str>) -> Value {
        let items: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": name, "namespace": "default" },
                    "spec": { "ports": [{ "port": 80 }] }
                })
            })
            .collect();
        let mut metadata = json!({ "resourceVersion": "42" });
        if let Some(token) = continue_token {
            metadata["continue"] = json!(token);
        }
        json!({ "apiVersion": "v1", "kind": "ServiceList", "metadata": metadata, "items": items })
    }

    fn failure(code: u16, reason: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{reason} from test server"),
            "reason": reason,
            "code": code
        })
    }

    fn names(services: &[Service]) -> Vec<String> {
        services.iter().map(|s| s.name_any()).collect()
    }

    #[tokio::test]
    async fn list_follows_continue_tokens() {
        let (client, seen) = scripted_client(vec![
            (200, service_page(&["a"], Some("page-2"))),
            (200, service_page(&["b"], None)),
        ]);
        let cluster = KubeClusterApi::new(client)
            .with_page_size(1)
            .with_backoff(fast_backoff());

        let services = cluster
            .list_services(Scope::Namespace("default".to_string()), None)
            .await
            .unwrap();

        assert_eq!(names(&services), vec!["a", "b"]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("limit=1"), "{}", seen[0]);
        assert!(!seen[0].contains("continue="), "{}", seen[0]);
        assert!(seen[1].contains("continue=page-2"), "{}", seen[1]);
    }

    #[tokio::test]
    async fn empty_continue_token_ends_listing() {
        let (client, seen) = scripted_client(vec![(200, service_page(&["a"], Some("")))]);
        let cluster = KubeClusterApi::new(client).with_backoff(fast_backoff());

        let services = cluster.list_services(Scope::Cluster, None).await.unwrap();

        assert_eq!(names(&services), vec!["a"]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_api_server_is_retried() {
        let (client, seen) = scripted_client(vec![
            (503, failure(503, "ServiceUnavailable")),
            (200, service_page(&["a"], None)),
        ]);
        let cluster = KubeClusterApi::new(client).with_backoff(fast_backoff());

        let services = cluster
            .list_services(Scope::Namespace("default".to_string()), Some("app=web".to_string()))
            .await
            .unwrap();

        assert_eq!(names(&services), vec!["a"]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert!(seen[0].contains("labelSelector=app%3Dweb"), "{}", seen[0]);
    }

    #[tokio::test]
    async fn retry_resumes_at_the_failed_page() {
        let (client, seen) = scripted_client(vec![
            (200, service_page(&["a"], Some("page-2"))),
            (429, failure(429, "TooManyRequests")),
            (200, service_page(&["b"], None)),
        ]);
        let cluster = KubeClusterApi::new(client)
            .with_page_size(1)
            .with_backoff(fast_backoff());

        let services = cluster.list_services(Scope::Cluster, None).await.unwrap();

        assert_eq!(names(&services), vec!["a", "b"]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[2].contains("continue=page-2"), "{}", seen[2]);
    }

    #[tokio::test]
    async fn forbidden_list_is_not_retried() {
        let (client, seen) = scripted_client(vec![(403, failure(403, "Forbidden"))]);
        let cluster = KubeClusterApi::new(client).with_backoff(fast_backoff());

        let err = cluster.list_services(Scope::Cluster, None).await.unwrap_err();

        assert!(matches!(err, kube::Error::Api(ref ae) if ae.code == 403), "{err:?}");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_limit() {
        let (client, seen) = scripted_client(vec![
            (503, failure(503, "ServiceUnavailable")),
            (503, failure(503, "ServiceUnavailable")),
            (503, failure(503, "ServiceUnavailable")),
        ]);
        let cluster = KubeClusterApi::new(client).with_backoff(fast_backoff());

        let err = cluster.list_services(Scope::Cluster, None).await.unwrap_err();

        assert!(matches!(err, kube::Error::Api(ref ae) if ae.code == 503), "{err:?}");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tls_secrets_are_listed_as_metadata() {
        let page = json!({
            "apiVersion": "meta.k8s.io/v1",
            "kind": "PartialObjectMetadataList",
            "metadata": { "resourceVersion": "7" },
            "items": [{
                "apiVersion": "meta.k8s.io/v1",
                "kind": "PartialObjectMetadata",
                "metadata": { "name": "example.com-cert", "namespace": "default" }
            }]
        });
        let (client, seen) = scripted_client(vec![(200, page)]);
        let cluster = KubeClusterApi::new(client).with_backoff(fast_backoff());

        let secrets = cluster
            .list_tls_secrets(Scope::Namespace("default".to_string()))
            .await
            .unwrap();

        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name_any(), "example.com-cert");
        let seen = seen.lock().unwrap();
        assert!(seen[0].contains("fieldSelector=type%3Dkubernetes.io%2Ftls"), "{}", seen[0]);
    }

    #[test]
    fn scope_from_optional_namespace() {
        assert_eq!(Scope::from_namespace(None), Scope::Cluster);
        assert_eq!(
            Scope::from_namespace(Some("default".to_string())),
            Scope::Namespace("default".to_string())
        );
    }
}
