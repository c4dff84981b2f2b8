//! unpin core types: object identity, feed events, the error taxonomy and
//! the handler seam shared by the store, reconciler and controller crates.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;

pub mod phase;

pub use phase::{Phase, PhaseTracker};

pub mod prelude {
    pub use super::{
        ClientError, FeedEvent, ObjectKey, ResourceEventHandler, Scope, Transition, WatchEvent,
    };
    pub use super::phase::{Phase, PhaseTracker};
}

/// Identity of a Deployment: `(namespace, name)`, rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an object, `None` when `metadata.name` is missing.
    pub fn from_object(obj: &Deployment) -> Option<Self> {
        let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `metadata.resourceVersion` of an object, if the server issued one.
pub fn resource_version(obj: &Deployment) -> Option<&str> {
    obj.metadata.resource_version.as_deref().filter(|rv| !rv.is_empty())
}

/// Namespace scope of the list/watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Namespace(String),
}

impl Scope {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Namespace(ns) => Some(ns.as_str()),
        }
    }
}

impl FromStr for Scope {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            Ok(Scope::All)
        } else {
            Ok(Scope::Namespace(s.to_string()))
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Raw event from a watch stream, as decoded by the remote client.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Deployment),
    Modified(Deployment),
    Deleted(Deployment),
    /// Progress marker: advances the cursor, carries no object.
    Bookmark { resource_version: String },
}

impl WatchEvent {
    /// Cursor candidate carried by this event.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => resource_version(o),
            WatchEvent::Bookmark { resource_version } => Some(resource_version.as_str()),
        }
    }
}

/// Event produced by the change feed for the cache.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Full list result; replaces the cache contents.
    Relisted(Vec<Deployment>),
    Added(Deployment),
    Modified(Deployment),
    Deleted(Deployment),
    /// Periodic resync tick: re-deliver every cached object.
    Resync,
}

/// Cache transition handed to the dispatcher. Snapshots are immutable.
#[derive(Debug, Clone)]
pub enum Transition {
    Add(Arc<Deployment>),
    Update { old: Arc<Deployment>, new: Arc<Deployment> },
    Delete(Arc<Deployment>),
}

impl Transition {
    pub fn object(&self) -> &Deployment {
        match self {
            Transition::Add(o) | Transition::Delete(o) => o,
            Transition::Update { new, .. } => new,
        }
    }

    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::from_object(self.object())
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Transition::Add(_) => "add",
            Transition::Update { .. } => "update",
            Transition::Delete(_) => "delete",
        }
    }
}

/// Errors surfaced by the remote state client.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    /// Transport failure (connect, reset, timeout). Retried by callers.
    #[error("connection: {0}")]
    Connection(String),
    /// The watch cursor expired server-side; a full list is required.
    #[error("gone: {0}")]
    Gone(String),
    /// The object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// The server sent something that does not decode as the expected object.
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Subscriber for cache transitions. Every method defaults to a no-op so
/// handlers only implement what they care about.
#[async_trait::async_trait]
pub trait ResourceEventHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "handler"
    }

    async fn on_add(&self, _obj: Arc<Deployment>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update(&self, _old: Arc<Deployment>, _new: Arc<Deployment>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_delete(&self, _obj: Arc<Deployment>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn dep(ns: Option<&str>, name: Option<&str>, rv: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                namespace: ns.map(str::to_string),
                name: name.map(str::to_string),
                resource_version: rv.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn object_key_renders_namespace_slash_name() {
        let key = ObjectKey::from_object(&dep(Some("default"), Some("web"), None)).expect("key");
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn object_key_requires_name() {
        assert!(ObjectKey::from_object(&dep(Some("default"), None, None)).is_none());
        assert!(ObjectKey::from_object(&dep(Some("default"), Some(""), None)).is_none());
    }

    #[test]
    fn scope_parses_all_and_namespaces() {
        assert_eq!("all".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!("ALL".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!("".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!("kube-system".parse::<Scope>().unwrap(), Scope::Namespace("kube-system".into()));
        assert_eq!(Scope::Namespace("team-a".into()).namespace(), Some("team-a"));
        assert_eq!(Scope::All.to_string(), "all");
    }

    #[test]
    fn empty_resource_version_is_absent() {
        assert_eq!(resource_version(&dep(None, Some("a"), Some(""))), None);
        assert_eq!(resource_version(&dep(None, Some("a"), Some("7"))), Some("7"));
        let bm = WatchEvent::Bookmark { resource_version: "42".into() };
        assert_eq!(bm.resource_version(), Some("42"));
    }

    #[test]
    fn transient_classification() {
        assert!(ClientError::Connection("reset".into()).is_transient());
        assert!(ClientError::Api { code: 503, message: "unavailable".into() }.is_transient());
        assert!(!ClientError::Conflict("stale".into()).is_transient());
        assert!(!ClientError::Api { code: 422, message: "invalid".into() }.is_transient());
    }
}
