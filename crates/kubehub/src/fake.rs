//! In-memory API server for tests: monotonically increasing resource
//! versions, conditional updates, a replayable change history that can be
//! compacted (expired cursors answer `Gone`), forced disconnects and
//! malformed-event injection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tokio::sync::mpsc;
use unpin_core::{resource_version, ClientError, ClientResult, ObjectKey, WatchEvent};

use crate::{DeploymentClient, ListPage, WatchStream};

type Watcher = mpsc::UnboundedSender<ClientResult<WatchEvent>>;

#[derive(Default)]
struct State {
    rv: u64,
    objects: BTreeMap<ObjectKey, Deployment>,
    history: Vec<(u64, WatchEvent)>,
    /// Cursors older than this answer `Gone`.
    compacted: u64,
    watchers: Vec<Watcher>,
    updates: Vec<Deployment>,
    failures: VecDeque<ClientError>,
    watch_failures: VecDeque<ClientError>,
    lists: usize,
    watch_cursors: Vec<String>,
}

impl State {
    fn record(&mut self, rv: u64, ev: WatchEvent) {
        self.history.push((rv, ev.clone()));
        self.watchers.retain(|w| w.send(Ok(ev.clone())).is_ok());
    }

    fn store(&mut self, mut obj: Deployment) -> Deployment {
        self.rv += 1;
        obj.metadata.resource_version = Some(self.rv.to_string());
        obj
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Create or overwrite an object unconditionally, as another writer would.
    pub fn apply(&self, obj: Deployment) -> Deployment {
        let Some(key) = ObjectKey::from_object(&obj) else { return obj };
        let mut st = self.lock();
        let existed = st.objects.contains_key(&key);
        let stored = st.store(obj);
        st.objects.insert(key, stored.clone());
        let rv = st.rv;
        let ev = if existed { WatchEvent::Modified(stored.clone()) } else { WatchEvent::Added(stored.clone()) };
        st.record(rv, ev);
        stored
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Deployment> {
        let mut st = self.lock();
        let removed = st.objects.remove(key)?;
        st.rv += 1;
        let mut tomb = removed.clone();
        tomb.metadata.resource_version = Some(st.rv.to_string());
        let rv = st.rv;
        st.record(rv, WatchEvent::Deleted(tomb));
        Some(removed)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Deployment> { self.lock().objects.get(key).cloned() }
    pub fn resource_version(&self) -> u64 { self.lock().rv }

    /// Every update call received, successful or not.
    pub fn updates(&self) -> Vec<Deployment> { self.lock().updates.clone() }
    pub fn update_calls(&self) -> usize { self.lock().updates.len() }
    pub fn list_calls(&self) -> usize { self.lock().lists }
    pub fn watch_cursors(&self) -> Vec<String> { self.lock().watch_cursors.clone() }
    pub fn open_watches(&self) -> usize { self.lock().watchers.iter().filter(|w| !w.is_closed()).count() }

    /// Make the next update call fail with `err` before any version check.
    pub fn fail_next_update(&self, err: ClientError) { self.lock().failures.push_back(err); }

    /// Make the next watch call fail with `err` instead of opening a stream.
    pub fn fail_next_watch(&self, err: ClientError) { self.lock().watch_failures.push_back(err); }

    /// End every open watch stream, as a server restart would.
    pub fn disconnect(&self) { self.lock().watchers.clear(); }

    /// Drop the change history: open watches receive `Gone`, and any cursor
    /// older than the current version is rejected.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.rv;
        st.history.clear();
        for w in st.watchers.drain(..) {
            let _ = w.send(Err(ClientError::Gone("too old resource version".into())));
        }
    }

    /// Send an undecodable event to every open watch.
    pub fn inject_malformed(&self) {
        let mut st = self.lock();
        st.watchers.retain(|w| w.send(Err(ClientError::Malformed("bad event payload".into()))).is_ok());
    }

    /// Advance the version without touching any Deployment (as writes to
    /// other kinds do) and send a bookmark for it to every open watch.
    pub fn bookmark(&self) {
        let mut st = self.lock();
        st.rv += 1;
        let ev = WatchEvent::Bookmark { resource_version: st.rv.to_string() };
        st.watchers.retain(|w| w.send(Ok(ev.clone())).is_ok());
    }
}

#[async_trait]
impl DeploymentClient for FakeCluster {
    async fn list(&self) -> ClientResult<ListPage> {
        let mut st = self.lock();
        st.lists += 1;
        Ok(ListPage { items: st.objects.values().cloned().collect(), resource_version: Some(st.rv.to_string()) })
    }

    async fn watch(&self, cursor: &str) -> ClientResult<WatchStream> {
        let mut st = self.lock();
        st.watch_cursors.push(cursor.to_string());
        if let Some(err) = st.watch_failures.pop_front() {
            return Err(err);
        }
        let from: u64 = cursor
            .parse()
            .map_err(|_| ClientError::Api { code: 400, message: format!("invalid resourceVersion {cursor:?}") })?;
        if from < st.compacted {
            return Err(ClientError::Gone(format!("resourceVersion {from} is older than {}", st.compacted)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for (rv, ev) in st.history.iter() {
            if *rv > from {
                let _ = tx.send(Ok(ev.clone()));
            }
        }
        st.watchers.push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }

    async fn get(&self, key: &ObjectKey) -> ClientResult<Deployment> {
        self.object(key).ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn update(&self, obj: &Deployment) -> ClientResult<Deployment> {
        let mut st = self.lock();
        st.updates.push(obj.clone());
        if let Some(err) = st.failures.pop_front() {
            return Err(err);
        }
        let key = ObjectKey::from_object(obj).ok_or_else(|| ClientError::Malformed("missing name".into()))?;
        let expected = resource_version(obj).ok_or_else(|| ClientError::Malformed("missing resourceVersion".into()))?;
        let current = st.objects.get(&key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if resource_version(current) != Some(expected) {
            return Err(ClientError::Conflict(format!(
                "{key}: expected version {expected}, have {}",
                resource_version(current).unwrap_or("?")
            )));
        }
        let stored = st.store(obj.clone());
        st.objects.insert(key, stored.clone());
        let rv = st.rv;
        st.record(rv, WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }
}

// ---- fixtures ----

pub fn node_affinity() -> NodeAffinity {
    NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "kubernetes.io/hostname".into(),
                    operator: "In".into(),
                    values: Some(vec!["node-a".into()]),
                }]),
                match_fields: None,
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    }
}

fn affinity_term(app: &str) -> PodAffinityTerm {
    PodAffinityTerm {
        topology_key: "kubernetes.io/hostname".into(),
        label_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_affinity() -> PodAffinity {
    PodAffinity { required_during_scheduling_ignored_during_execution: Some(vec![affinity_term("cache")]), ..Default::default() }
}

pub fn pod_anti_affinity() -> PodAntiAffinity {
    PodAntiAffinity { required_during_scheduling_ignored_during_execution: Some(vec![affinity_term("web")]), ..Default::default() }
}

/// A minimal Deployment `ns/name` with the given pod template affinity.
pub fn deployment(ns: &str, name: &str, affinity: Option<Affinity>) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    Deployment {
        metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() },
        spec: Some(DeploymentSpec {
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    affinity,
                    containers: vec![Container { name: "app".into(), image: Some("nginx:1.27".into()), ..Default::default() }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Deployment pinned to a node, optionally with pod affinity alongside.
pub fn pinned(ns: &str, name: &str, with_pod_affinity: bool) -> Deployment {
    deployment(
        ns,
        name,
        Some(Affinity {
            node_affinity: Some(node_affinity()),
            pod_affinity: with_pod_affinity.then(pod_affinity),
            pod_anti_affinity: None,
        }),
    )
}
