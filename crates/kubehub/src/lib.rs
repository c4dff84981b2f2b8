//! unpin kubehub: the remote state client for Deployments, credential
//! discovery and the list+watch change feed.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    core::ErrorResponse,
    Client,
};
use tracing::debug;
use unpin_core::{resource_version, ClientError, ClientResult, ObjectKey, Scope, WatchEvent};

pub mod credentials;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod feed;

pub use credentials::{connect, CredentialChain, CredentialError, CredentialProvider};
pub use feed::{ChangeFeed, FeedConfig};

/// Upper bound accepted by the API server for `timeoutSeconds` on watches.
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// Result of a full list: the items plus the collection version to watch from.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<Deployment>,
    pub resource_version: Option<String>,
}

pub type WatchStream = BoxStream<'static, ClientResult<WatchEvent>>;

/// List/watch/get/update for Deployments within the scope the client was
/// built for.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn list(&self) -> ClientResult<ListPage>;

    /// Open a watch stream starting after `cursor`.
    async fn watch(&self, cursor: &str) -> ClientResult<WatchStream>;

    async fn get(&self, key: &ObjectKey) -> ClientResult<Deployment>;

    /// Conditional replace. The object's `metadata.resourceVersion` is the
    /// expected version; a stale one yields `ClientError::Conflict`.
    async fn update(&self, obj: &Deployment) -> ClientResult<Deployment>;
}

/// `DeploymentClient` backed by kube-rs.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    scope: Scope,
    watch_timeout_secs: u32,
}

impl KubeClient {
    pub fn new(client: Client, scope: Scope) -> Self {
        Self { client, scope, watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS }
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    fn scoped(&self) -> Api<Deployment> {
        match self.scope.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn namespaced(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl DeploymentClient for KubeClient {
    async fn list(&self) -> ClientResult<ListPage> {
        let list = self.scoped().list(&ListParams::default()).await.map_err(map_kube_error)?;
        debug!(count = list.items.len(), rv = ?list.metadata.resource_version, "listed deployments");
        Ok(ListPage { resource_version: list.metadata.resource_version.clone(), items: list.items })
    }

    async fn watch(&self, cursor: &str) -> ClientResult<WatchStream> {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.scoped().watch(&wp, cursor).await.map_err(map_kube_error)?;
        Ok(stream
            .map(|res| match res {
                Ok(ev) => from_kube_event(ev),
                Err(e) => Err(map_kube_error(e)),
            })
            .boxed())
    }

    async fn get(&self, key: &ObjectKey) -> ClientResult<Deployment> {
        self.namespaced(&key.namespace).get(&key.name).await.map_err(map_kube_error)
    }

    async fn update(&self, obj: &Deployment) -> ClientResult<Deployment> {
        let key = ObjectKey::from_object(obj)
            .ok_or_else(|| ClientError::Malformed("object missing metadata.name".into()))?;
        if resource_version(obj).is_none() {
            return Err(ClientError::Malformed(format!("{key}: missing metadata.resourceVersion")));
        }
        self.namespaced(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(map_kube_error)
    }
}

fn from_kube_event(ev: kube::api::WatchEvent<Deployment>) -> ClientResult<WatchEvent> {
    use kube::api::WatchEvent as K;
    match ev {
        K::Added(o) => Ok(WatchEvent::Added(o)),
        K::Modified(o) => Ok(WatchEvent::Modified(o)),
        K::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        K::Bookmark(bm) => Ok(WatchEvent::Bookmark { resource_version: bm.metadata.resource_version }),
        K::Error(resp) => Err(map_error_response(resp)),
    }
}

/// Classify an API status into the client error taxonomy.
pub fn map_error_response(resp: ErrorResponse) -> ClientError {
    match resp.code {
        409 => ClientError::Conflict(resp.message),
        404 => ClientError::NotFound(resp.message),
        410 => ClientError::Gone(resp.message),
        _ if resp.reason == "Expired" || resp.reason == "Gone" => ClientError::Gone(resp.message),
        code => ClientError::Api { code, message: resp.message },
    }
}

pub fn map_kube_error(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => map_error_response(resp),
        kube::Error::SerdeError(e) => ClientError::Malformed(e.to_string()),
        other => ClientError::Connection(other.to_string()),
    }
}
