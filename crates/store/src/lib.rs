//! unpin store: the keyed Deployment cache and the handler dispatcher.
//!
//! A single ingest task owns the `CacheWriter`, applies feed events in order
//! and publishes frozen snapshots through `ArcSwap`; readers never block the
//! writer. Every mutation also yields `Transition`s for the dispatcher.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use k8s_openapi::api::apps::v1::Deployment;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use unpin_core::{resource_version, FeedEvent, ObjectKey, Transition};

pub mod dispatch;

pub use dispatch::{Dispatcher, InFlight};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("timed out after {0:?} waiting for the initial list to sync")]
    SyncTimeout(Duration),
}

/// Frozen view of the cache at one point in the apply order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub epoch: u64,
    pub items: FxHashMap<ObjectKey, Arc<Deployment>>,
}

/// Single writer of the cache. Applies feed events and reports the
/// resulting transitions.
pub struct CacheWriter {
    items: FxHashMap<ObjectKey, Arc<Deployment>>,
    epoch: u64,
    snap: Arc<ArcSwap<Snapshot>>,
    synced: watch::Sender<bool>,
    listed: bool,
}

impl CacheWriter {
    /// A writer and a reader over the same (empty, unsynced) cache.
    pub fn new() -> (Self, CacheReader) {
        let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let (synced, synced_rx) = watch::channel(false);
        let reader = CacheReader { snap: Arc::clone(&snap), synced: synced_rx };
        (Self { items: FxHashMap::default(), epoch: 0, snap, synced, listed: false }, reader)
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Apply one event and publish the new snapshot. Transitions are returned
    /// in the order handlers must see them.
    pub fn apply(&mut self, ev: FeedEvent) -> Vec<Transition> {
        let out = self.stage(ev);
        self.publish();
        out
    }

    /// Apply one event without publishing; readers see it after the next
    /// `publish`.
    pub fn stage(&mut self, ev: FeedEvent) -> Vec<Transition> {
        match ev {
            FeedEvent::Relisted(list) => self.replace(list),
            FeedEvent::Added(obj) | FeedEvent::Modified(obj) => self.upsert(obj).into_iter().collect(),
            FeedEvent::Deleted(obj) => self.remove(obj).into_iter().collect(),
            FeedEvent::Resync => self.resync(),
        }
    }

    fn upsert(&mut self, obj: Deployment) -> Option<Transition> {
        let Some(key) = ObjectKey::from_object(&obj) else {
            warn!("skipping object without metadata.name");
            return None;
        };
        let new = Arc::new(obj);
        match self.items.insert(key, Arc::clone(&new)) {
            Some(old) => Some(Transition::Update { old, new }),
            None => Some(Transition::Add(new)),
        }
    }

    fn remove(&mut self, obj: Deployment) -> Option<Transition> {
        let Some(key) = ObjectKey::from_object(&obj) else {
            warn!("skipping delete without metadata.name");
            return None;
        };
        if self.items.remove(&key).is_none() {
            debug!(key = %key, "delete for unknown key");
        }
        Some(Transition::Delete(Arc::new(obj)))
    }

    fn replace(&mut self, list: Vec<Deployment>) -> Vec<Transition> {
        let mut out = Vec::with_capacity(list.len());
        let mut next: FxHashMap<ObjectKey, Arc<Deployment>> = FxHashMap::default();
        next.reserve(list.len());
        for obj in list {
            let Some(key) = ObjectKey::from_object(&obj) else {
                warn!("skipping listed object without metadata.name");
                continue;
            };
            let new = Arc::new(obj);
            match self.items.get(&key) {
                Some(old) => out.push(Transition::Update { old: Arc::clone(old), new: Arc::clone(&new) }),
                None => out.push(Transition::Add(Arc::clone(&new))),
            }
            next.insert(key, new);
        }
        let mut gone: Vec<_> = self.items.iter().filter(|(k, _)| !next.contains_key(*k)).collect();
        gone.sort_unstable_by(|a, b| a.0.cmp(b.0));
        out.extend(gone.into_iter().map(|(_, old)| Transition::Delete(Arc::clone(old))));
        self.items = next;
        self.listed = true;
        debug!(count = self.items.len(), "relist applied");
        out
    }

    fn resync(&self) -> Vec<Transition> {
        let mut keys: Vec<_> = self.items.keys().collect();
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|k| self.items.get(k))
            .map(|o| Transition::Update { old: Arc::clone(o), new: Arc::clone(o) })
            .collect()
    }

    /// Publish staged changes as a new snapshot. Readers are told the cache
    /// is synced only once the first relist is visible.
    pub fn publish(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
        self.snap.store(Arc::new(Snapshot { epoch: self.epoch, items: self.items.clone() }));
        if self.listed && !*self.synced.borrow() {
            self.synced.send_replace(true);
            info!(count = self.items.len(), "cache synced");
        }
    }
}

/// Cheap, cloneable read handle.
#[derive(Clone)]
pub struct CacheReader {
    snap: Arc<ArcSwap<Snapshot>>,
    synced: watch::Receiver<bool>,
}

impl CacheReader {
    pub fn snapshot(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Deployment>> { self.snap.load().items.get(key).cloned() }
    pub fn len(&self) -> usize { self.snap.load().items.len() }
    pub fn is_empty(&self) -> bool { self.snap.load().items.is_empty() }
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.snap.load().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn resource_version(&self, key: &ObjectKey) -> Option<String> {
        self.get(key).and_then(|o| resource_version(&o).map(str::to_string))
    }

    /// True once the initial list has been applied.
    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Wait until `has_synced()` or fail after `timeout`.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), StoreError> {
        let mut rx = self.synced.clone();
        let synced = tokio::time::timeout(timeout, async { rx.wait_for(|s| *s).await.map(|_| ()) }).await;
        match synced {
            Ok(Ok(())) => Ok(()),
            // Writer dropped before syncing: it never will.
            Ok(Err(_)) | Err(_) => Err(StoreError::SyncTimeout(timeout)),
        }
    }
}

/// Running ingest loop: feed events in, transitions out.
pub struct Ingest {
    pub events: mpsc::Sender<FeedEvent>,
    pub cache: CacheReader,
    pub transitions: mpsc::Receiver<Transition>,
    pub task: JoinHandle<()>,
}

/// Spawn the single-writer ingest loop. It stops once every `events`
/// sender is dropped, after forwarding what it already applied.
pub fn spawn_ingest(cap: usize) -> Ingest { spawn_ingest_with(CacheWriter::new(), cap) }

/// Like `spawn_ingest`, over a cache whose reader was handed out earlier.
///
/// Events already queued are applied as one batch and published once;
/// their transitions are forwarded only after that publish, so a handler
/// never sees an object newer than the cache.
pub fn spawn_ingest_with((mut writer, reader): (CacheWriter, CacheReader), cap: usize) -> Ingest {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<FeedEvent>(cap);
    let (t_tx, t_rx) = mpsc::channel::<Transition>(cap);

    let task = tokio::spawn(async move {
        let mut dispatch_open = true;
        let mut batch = Vec::new();
        while let Some(ev) = rx.recv().await {
            batch.extend(writer.stage(ev));
            let mut staged = 1;
            while staged < cap {
                match rx.try_recv() {
                    Ok(ev) => {
                        batch.extend(writer.stage(ev));
                        staged += 1;
                    }
                    Err(_) => break,
                }
            }
            writer.publish();
            for t in batch.drain(..) {
                if dispatch_open && t_tx.send(t).await.is_err() {
                    debug!("transition receiver dropped; cache keeps applying");
                    dispatch_open = false;
                }
            }
        }
        info!(items = writer.len(), "ingest loop stopped");
    });

    Ingest { events: tx, cache: reader, transitions: t_rx, task }
}
