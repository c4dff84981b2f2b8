//! Change feed: list, then watch from the list's version, reconnecting with
//! backoff from the last acknowledged cursor. An expired cursor falls back to
//! a full relist, paced by the same backoff. A resync timer independently asks the cache to re-deliver
//! everything it holds.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unpin_core::{ClientError, FeedEvent, Phase, PhaseTracker, WatchEvent};

use crate::DeploymentClient;

const BACKOFF_INITIAL_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Zero disables periodic resync.
    pub resync_period: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            backoff_initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff, reset whenever the watch delivers an event.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }

    fn reset(&mut self) { self.current = self.initial; }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

enum StreamEnd {
    Closed,
    Expired(String),
    Failed(ClientError),
    Cancelled,
}

pub struct ChangeFeed<C: ?Sized> {
    client: Arc<C>,
    cfg: FeedConfig,
}

impl<C> ChangeFeed<C>
where
    C: DeploymentClient + ?Sized + 'static,
{
    pub fn new(client: Arc<C>, cfg: FeedConfig) -> Self { Self { client, cfg } }

    /// Drive the feed until `cancel` fires or the receiver goes away.
    pub async fn run(self, tx: mpsc::Sender<FeedEvent>, phase: PhaseTracker, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.cfg.backoff_initial, self.cfg.backoff_max);
        let mut resync = resync_timer(self.cfg.resync_period);
        let mut cursor: Option<String> = None;
        info!(resync = ?self.cfg.resync_period, "change feed started");

        loop {
            let from = match cursor.clone() {
                Some(rv) => rv,
                None => {
                    phase.advance(Phase::Syncing);
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.client.list() => r,
                    };
                    match listed {
                        Ok(page) => {
                            counter!("feed_relists", 1u64);
                            let Some(rv) = page.resource_version.filter(|rv| !rv.is_empty()) else {
                                warn!("list returned no resourceVersion; retrying");
                                if !pause(backoff.next_delay(), &cancel).await { break; }
                                continue;
                            };
                            info!(count = page.items.len(), rv = %rv, "list complete");
                            if !deliver(&tx, FeedEvent::Relisted(page.items), &cancel).await { break; }
                            cursor = Some(rv.clone());
                            rv
                        }
                        Err(e) => {
                            warn!(error = %e, "list failed; retrying");
                            if !pause(backoff.next_delay(), &cancel).await { break; }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.client.watch(&from) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(ClientError::Gone(msg)) => {
                    counter!("feed_reconnects", 1u64);
                    info!(cursor = %from, reason = %msg, "watch cursor expired; relisting");
                    cursor = None;
                    if !pause(backoff.next_delay(), &cancel).await { break; }
                    continue;
                }
                Err(e) => {
                    counter!("feed_reconnects", 1u64);
                    warn!(cursor = %from, error = %e, "watch open failed; backing off");
                    if !pause(backoff.next_delay(), &cancel).await { break; }
                    continue;
                }
            };
            debug!(cursor = %from, "watch opened");
            let opened_at = Instant::now();

            let end = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break StreamEnd::Cancelled,
                    _ = tick(&mut resync) => {
                        debug!("periodic resync");
                        if !deliver(&tx, FeedEvent::Resync, &cancel).await { break StreamEnd::Cancelled; }
                    }
                    next = stream.next() => match next {
                        None => break StreamEnd::Closed,
                        Some(Ok(ev)) => {
                            backoff.reset();
                            if let Some(rv) = ev.resource_version() {
                                cursor = Some(rv.to_string());
                            }
                            let fe = match ev {
                                WatchEvent::Added(o) => FeedEvent::Added(o),
                                WatchEvent::Modified(o) => FeedEvent::Modified(o),
                                WatchEvent::Deleted(o) => FeedEvent::Deleted(o),
                                WatchEvent::Bookmark { .. } => continue,
                            };
                            if !deliver(&tx, fe, &cancel).await { break StreamEnd::Cancelled; }
                        }
                        Some(Err(ClientError::Gone(msg))) => break StreamEnd::Expired(msg),
                        Some(Err(ClientError::Malformed(msg))) => {
                            counter!("feed_malformed_events", 1u64);
                            warn!(error = %msg, "skipping malformed watch event");
                        }
                        Some(Err(e)) => break StreamEnd::Failed(e),
                    }
                }
            };
            drop(stream);

            match end {
                StreamEnd::Cancelled => break,
                StreamEnd::Expired(msg) => {
                    info!(cursor = ?cursor, reason = %msg, "watch cursor expired; relisting");
                    cursor = None;
                    if !pause(backoff.next_delay(), &cancel).await { break; }
                }
                StreamEnd::Closed => {
                    counter!("feed_reconnects", 1u64);
                    // A server-side timeout on a quiet watch is not a failure.
                    if opened_at.elapsed() >= self.cfg.backoff_max {
                        backoff.reset();
                    }
                    debug!(cursor = ?cursor, "watch stream closed; resuming");
                    if !pause(backoff.next_delay(), &cancel).await { break; }
                }
                StreamEnd::Failed(e) => {
                    counter!("feed_reconnects", 1u64);
                    warn!(cursor = ?cursor, error = %e, "watch stream failed; resuming");
                    if !pause(backoff.next_delay(), &cancel).await { break; }
                }
            }
        }
        info!("change feed stopped");
    }
}

fn resync_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut iv = tokio::time::interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(iv)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Send unless cancelled; false means the feed should stop.
async fn deliver(tx: &mpsc::Sender<FeedEvent>, ev: FeedEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        r = tx.send(ev) => r.is_ok(),
    }
}

/// Sleep unless cancelled; false means the feed should stop.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
