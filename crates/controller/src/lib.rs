//! unpin controller: owns the feed, the cache ingest loop and the dispatcher,
//! and moves them through `Created -> Running -> Syncing -> Steady -> Stopped`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unpin_core::{Phase, PhaseTracker, ResourceEventHandler};
use unpin_kubehub::{ChangeFeed, DeploymentClient, FeedConfig};
use unpin_reconcile::AffinityStripper;
use unpin_store::{spawn_ingest_with, CacheReader, CacheWriter, Dispatcher, InFlight};

mod config;

pub use config::ControllerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("initial cache sync did not complete within {0:?}")]
    SyncTimeout(Duration),
    #[error("controller already started")]
    AlreadyStarted,
    #[error("cancelled before the initial cache sync completed")]
    Cancelled,
}

struct Running {
    feed: JoinHandle<()>,
    ingest: JoinHandle<()>,
    dispatch: JoinHandle<()>,
    in_flight: InFlight,
}

pub struct Controller {
    client: Arc<dyn DeploymentClient>,
    config: ControllerConfig,
    phase: PhaseTracker,
    cancel: CancellationToken,
    /// Taken by `start`.
    dispatcher: Option<Dispatcher>,
    writer: Option<CacheWriter>,
    cache: CacheReader,
    running: Option<Running>,
}

impl Controller {
    pub fn new(client: Arc<dyn DeploymentClient>, config: ControllerConfig) -> Self {
        let dispatcher = Dispatcher::new(config.concurrency).with_queue_cap(config.queue_cap);
        let (writer, cache) = CacheWriter::new();
        Self {
            client,
            config,
            phase: PhaseTracker::new(),
            cancel: CancellationToken::new(),
            dispatcher: Some(dispatcher),
            writer: Some(writer),
            cache,
            running: None,
        }
    }

    /// Handlers registered after `start` are ignored.
    pub fn register(&mut self, handler: Arc<dyn ResourceEventHandler>) -> &mut Self {
        match self.dispatcher.as_mut() {
            Some(d) => {
                debug!(handler = handler.name(), "handler registered");
                d.register(handler);
            }
            None => warn!(handler = handler.name(), "controller already started; handler ignored"),
        }
        self
    }

    /// Register the affinity stripper configured by `policy` and `triggers`,
    /// writing through this controller's client.
    pub fn register_stripper(&mut self) -> &mut Self {
        let stripper = AffinityStripper::new(Arc::clone(&self.client))
            .with_policy(self.config.policy)
            .with_triggers(self.config.triggers)
            .with_cancellation(self.cancel.clone())
            .with_cache(self.cache.clone());
        self.register(Arc::new(stripper))
    }

    pub fn phase(&self) -> Phase { self.phase.current() }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> { self.phase.subscribe() }

    /// Read access to the local cache; empty and unsynced before `start`.
    pub fn cache(&self) -> &CacheReader { &self.cache }

    /// Spawn the pipeline and wait for the initial sync. On timeout the
    /// pipeline is shut down before the error is returned.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        let (Some(dispatcher), Some(writer)) = (self.dispatcher.take(), self.writer.take()) else {
            return Err(ControllerError::AlreadyStarted);
        };
        let cfg = &self.config;
        info!(
            handlers = dispatcher.handlers(),
            concurrency = cfg.concurrency,
            resync = ?cfg.resync_period,
            policy = %cfg.policy,
            "controller starting"
        );

        let ingest = spawn_ingest_with((writer, self.cache.clone()), cfg.queue_cap);
        let in_flight = dispatcher.in_flight();
        let dispatch = tokio::spawn(dispatcher.run(ingest.transitions, self.cancel.clone()));
        self.phase.advance(Phase::Running);

        let feed_cfg = FeedConfig { resync_period: cfg.resync_period, backoff_max: cfg.backoff_max, ..FeedConfig::default() };
        let feed = ChangeFeed::new(Arc::clone(&self.client), feed_cfg);
        let feed = tokio::spawn(feed.run(ingest.events, self.phase.clone(), self.cancel.clone()));

        let cache = ingest.cache;
        self.running = Some(Running { feed, ingest: ingest.task, dispatch, in_flight });

        let timeout = self.config.sync_timeout;
        let synced = tokio::select! {
            r = cache.wait_for_sync(timeout) => r.map_err(|_| ControllerError::SyncTimeout(timeout)),
            _ = self.cancel.cancelled() => Err(ControllerError::Cancelled),
        };
        match synced {
            Ok(()) => {
                self.phase.advance(Phase::Steady);
                info!(items = cache.len(), "initial sync complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "controller failed to reach steady state");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    /// Start, run until `stop` (or the controller's own token) fires, then
    /// shut down. Cancellation during the initial sync is not an error.
    pub async fn run_until(&mut self, stop: CancellationToken) -> Result<(), ControllerError> {
        let cancel = self.cancel.clone();
        let link = tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });
        let res = match self.start().await {
            Ok(()) => {
                self.cancel.cancelled().await;
                Ok(())
            }
            Err(ControllerError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        };
        self.shutdown().await;
        link.abort();
        res
    }

    /// Cancel everything, give the feed and in-flight handlers `grace` to
    /// finish, then stop. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(r) = self.running.take() {
            let grace = self.config.grace;
            settle("feed", r.feed, grace).await;
            settle("ingest", r.ingest, grace).await;
            settle("dispatcher", r.dispatch, grace).await;
            if !r.in_flight.drain(grace).await {
                warn!(remaining = r.in_flight.len(), "handlers still running after grace period");
            }
        }
        if self.phase.advance(Phase::Stopped) {
            info!("controller stopped");
        }
    }
}

/// Wait for a background task up to `grace`, aborting it afterwards.
async fn settle(what: &'static str, mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => debug!(task = what, "task finished"),
        Ok(Err(e)) => warn!(task = what, error = %e, "task ended abnormally"),
        Err(_) => {
            warn!(task = what, ?grace, "task did not stop within grace period; aborting");
            task.abort();
        }
    }
}
