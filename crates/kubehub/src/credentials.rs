//! Ordered credential discovery: the first provider that yields a config wins.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::{debug, info};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn describe(&self) -> String;
    async fn load(&self) -> anyhow::Result<Config>;
}

/// Kubeconfig file at an explicit path, using its current context.
pub struct KubeconfigFile {
    path: PathBuf,
}

impl KubeconfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

#[async_trait]
impl CredentialProvider for KubeconfigFile {
    fn describe(&self) -> String { format!("kubeconfig {}", self.path.display()) }

    async fn load(&self) -> anyhow::Result<Config> {
        let kc = Kubeconfig::read_from(&self.path)
            .with_context(|| format!("reading kubeconfig at {}", self.path.display()))?;
        Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("loading kubeconfig at {}", self.path.display()))
    }
}

/// Service-account credentials mounted into a pod.
pub struct InCluster;

#[async_trait]
impl CredentialProvider for InCluster {
    fn describe(&self) -> String { "in-cluster service account".to_string() }

    async fn load(&self) -> anyhow::Result<Config> {
        Config::incluster().context("loading in-cluster config")
    }
}

/// Every provider failed; one entry per provider.
#[derive(Debug, thiserror::Error)]
#[error("could not establish cluster credentials: {}", .failures.join("; "))]
pub struct CredentialError {
    pub failures: Vec<String>,
}

#[derive(Default)]
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Kubeconfig file (when a path is known), then in-cluster.
    pub fn standard(kubeconfig: Option<PathBuf>) -> Self {
        let chain = Self::new();
        let chain = match kubeconfig {
            Some(path) => chain.with(KubeconfigFile::new(path)),
            None => chain,
        };
        chain.with(InCluster)
    }

    pub fn len(&self) -> usize { self.providers.len() }
    pub fn is_empty(&self) -> bool { self.providers.is_empty() }

    /// Try providers in order. Returns the winning provider's description
    /// with its config.
    pub async fn resolve(&self) -> Result<(String, Config), CredentialError> {
        let mut failures = Vec::with_capacity(self.providers.len());
        for p in &self.providers {
            match p.load().await {
                Ok(cfg) => return Ok((p.describe(), cfg)),
                Err(e) => {
                    debug!(provider = %p.describe(), error = %format!("{e:#}"), "credential provider failed");
                    failures.push(format!("{}: {e:#}", p.describe()));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no credential providers configured".to_string());
        }
        Err(CredentialError { failures })
    }
}

/// Resolve credentials and build a kube client.
pub async fn connect(chain: &CredentialChain) -> anyhow::Result<Client> {
    let (source, cfg) = chain.resolve().await?;
    info!(source = %source, cluster = %cfg.cluster_url, "cluster credentials established");
    Client::try_from(cfg).context("building kube client")
}
