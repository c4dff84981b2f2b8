//! unpin reconcile: keep node affinity out of Deployment pod templates.
//!
//! Detection and correction are pure functions over a snapshot; the write is
//! a conditional replace at the snapshot's resource version. Conflicts are not
//! retried here: the newer version arrives through the feed and triggers
//! another pass. With a cache attached, a snapshot the cache has already
//! moved past is not written at all.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Affinity, PodSpec};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unpin_core::{resource_version, ClientError, ObjectKey, ResourceEventHandler};
use unpin_kubehub::DeploymentClient;
use unpin_store::CacheReader;

/// What a correction removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StripPolicy {
    /// Clear `nodeAffinity` only; pod (anti-)affinity stays.
    #[default]
    NodeAffinity,
    /// Clear the whole `affinity` block.
    WholeAffinity,
}

impl FromStr for StripPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node-affinity" | "node" => Ok(StripPolicy::NodeAffinity),
            "whole-affinity" | "whole" | "all" => Ok(StripPolicy::WholeAffinity),
            other => Err(format!("unknown strip policy {other:?} (expected node-affinity or whole-affinity)")),
        }
    }
}

impl fmt::Display for StripPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StripPolicy::NodeAffinity => "node-affinity",
            StripPolicy::WholeAffinity => "whole-affinity",
        })
    }
}

/// Which notifications trigger a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triggers {
    pub on_add: bool,
    pub on_update: bool,
}

impl Default for Triggers {
    fn default() -> Self { Self { on_add: true, on_update: true } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to correct.
    Skip,
    /// The cache already holds a newer version (or none); that version gets
    /// its own pass.
    Superseded,
    /// Corrective update accepted; carries the server's copy.
    Corrected(Box<Deployment>),
    /// Update not applied. Already logged; the next event or resync retries.
    Failed(ClientError),
}

fn pod_spec(obj: &Deployment) -> Option<&PodSpec> {
    obj.spec.as_ref()?.template.spec.as_ref()
}

fn affinity_mut(obj: &mut Deployment) -> Option<&mut Option<Affinity>> {
    Some(&mut obj.spec.as_mut()?.template.spec.as_mut()?.affinity)
}

pub fn needs_correction(obj: &Deployment) -> bool {
    pod_spec(obj)
        .and_then(|s| s.affinity.as_ref())
        .map(|a| a.node_affinity.is_some())
        .unwrap_or(false)
}

/// Corrected copy of `obj`, or `None` when it already satisfies the invariant.
pub fn corrected(obj: &Deployment, policy: StripPolicy) -> Option<Deployment> {
    if !needs_correction(obj) {
        return None;
    }
    let mut fixed = obj.clone();
    let slot = affinity_mut(&mut fixed)?;
    match policy {
        StripPolicy::NodeAffinity => {
            if let Some(a) = slot.as_mut() {
                a.node_affinity = None;
            }
        }
        StripPolicy::WholeAffinity => *slot = None,
    }
    Some(fixed)
}

pub struct AffinityStripper<C: ?Sized> {
    client: Arc<C>,
    policy: StripPolicy,
    triggers: Triggers,
    cancel: CancellationToken,
    cache: Option<CacheReader>,
}

impl<C> AffinityStripper<C>
where
    C: DeploymentClient + ?Sized + 'static,
{
    pub fn new(client: Arc<C>) -> Self {
        Self { client, policy: StripPolicy::default(), triggers: Triggers::default(), cancel: CancellationToken::new(), cache: None }
    }

    pub fn with_policy(mut self, policy: StripPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_triggers(mut self, triggers: Triggers) -> Self {
        self.triggers = triggers;
        self
    }

    /// In-flight updates are abandoned once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check snapshots against `cache` before writing.
    pub fn with_cache(mut self, cache: CacheReader) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policy(&self) -> StripPolicy { self.policy }

    pub async fn reconcile(&self, obj: &Deployment) -> Action {
        let Some(fixed) = corrected(obj, self.policy) else { return Action::Skip };
        let Some(key) = ObjectKey::from_object(obj) else {
            return Action::Failed(ClientError::Malformed("object missing metadata.name".into()));
        };
        if resource_version(obj).is_none() {
            counter!("reconcile_failures", 1u64);
            warn!(key = %key, "refusing unconditional update: snapshot has no resourceVersion");
            return Action::Failed(ClientError::Malformed(format!("{key}: missing metadata.resourceVersion")));
        }
        if let Some(cache) = &self.cache {
            let latest = cache.resource_version(&key);
            if latest.as_deref() != resource_version(obj) {
                debug!(key = %key, snapshot = ?resource_version(obj), latest = ?latest, "snapshot superseded; skipping");
                return Action::Superseded;
            }
        }

        let res = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(key = %key, "shutdown before corrective update completed");
                return Action::Failed(ClientError::Connection("cancelled".into()));
            }
            r = self.client.update(&fixed) => r,
        };
        match res {
            Ok(updated) => {
                counter!("reconcile_corrected", 1u64);
                info!(
                    namespace = %key.namespace,
                    name = %key.name,
                    policy = %self.policy,
                    rv = resource_version(&updated).unwrap_or("-"),
                    "{key}, action=corrected"
                );
                Action::Corrected(Box::new(updated))
            }
            Err(e @ ClientError::Conflict(_)) => {
                counter!("reconcile_conflicts", 1u64);
                debug!(key = %key, error = %e, "stale snapshot; waiting for the newer version");
                Action::Failed(e)
            }
            Err(e @ ClientError::NotFound(_)) => {
                debug!(key = %key, "deleted before correction");
                Action::Failed(e)
            }
            Err(e) => {
                counter!("reconcile_failures", 1u64);
                warn!(key = %key, error = %e, transient = e.is_transient(), "corrective update failed");
                Action::Failed(e)
            }
        }
    }
}

#[async_trait]
impl<C> ResourceEventHandler for AffinityStripper<C>
where
    C: DeploymentClient + ?Sized + 'static,
{
    fn name(&self) -> &str { "affinity-stripper" }

    async fn on_add(&self, obj: Arc<Deployment>) -> anyhow::Result<()> {
        if self.triggers.on_add {
            self.reconcile(&obj).await;
        }
        Ok(())
    }

    async fn on_update(&self, _old: Arc<Deployment>, new: Arc<Deployment>) -> anyhow::Result<()> {
        if self.triggers.on_update {
            self.reconcile(&new).await;
        }
        Ok(())
    }

    async fn on_delete(&self, obj: Arc<Deployment>) -> anyhow::Result<()> {
        if let Some(key) = ObjectKey::from_object(&obj) {
            debug!(key = %key, "deployment deleted");
        }
        Ok(())
    }
}
