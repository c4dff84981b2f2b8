//! Fan cache transitions out to registered handlers.
//!
//! Per key, transitions are delivered one at a time in apply order; a key
//! that is busy accumulates a FIFO backlog. Different keys run in parallel,
//! bounded by a semaphore whose permits are taken before a task is spawned.
//! Once `queue_cap` transitions are waiting, the dispatcher stops reading its
//! channel, which pushes back on the ingest loop and the feed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use unpin_core::{ObjectKey, ResourceEventHandler, Transition};

type Handlers = Arc<[Arc<dyn ResourceEventHandler>]>;

const DEFAULT_QUEUE_CAP: usize = 1024;

pub struct Dispatcher {
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
    concurrency: usize,
    queue_cap: usize,
    tracker: TaskTracker,
}

/// Handle on dispatched handler invocations, for draining at shutdown.
#[derive(Clone)]
pub struct InFlight(TaskTracker);

impl InFlight {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Wait for in-flight invocations up to `grace`. Returns false if some
    /// were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.0.close();
        tokio::time::timeout(grace, self.0.wait()).await.is_ok()
    }
}

impl Dispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            handlers: Vec::new(),
            concurrency: concurrency.max(1),
            queue_cap: DEFAULT_QUEUE_CAP,
            tracker: TaskTracker::new(),
        }
    }

    /// Most transitions held back (waiting for a permit or behind a busy
    /// key) before the dispatcher stops reading.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ResourceEventHandler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn handlers(&self) -> usize { self.handlers.len() }

    pub fn in_flight(&self) -> InFlight { InFlight(self.tracker.clone()) }

    /// Consume transitions until the channel closes (then finish the backlog)
    /// or `cancel` fires (backlog is dropped; running invocations finish).
    pub async fn run(self, mut rx: mpsc::Receiver<Transition>, cancel: CancellationToken) {
        let handlers: Handlers = self.handlers.into();
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ObjectKey>();
        // Presence means the key has a transition running or in `ready`.
        let mut busy: FxHashMap<ObjectKey, VecDeque<Transition>> = FxHashMap::default();
        // Next transition of an otherwise idle key, waiting for a permit.
        let mut ready: VecDeque<(ObjectKey, Transition)> = VecDeque::new();
        let mut queued = 0usize;
        let spawn = |key: ObjectKey, t: Transition, permit: OwnedSemaphorePermit| {
            let handlers = Arc::clone(&handlers);
            let done = done_tx.clone();
            self.tracker.spawn(async move {
                for h in handlers.iter() {
                    invoke(Arc::clone(h), &key, t.clone()).await;
                }
                drop(permit);
                let _ = done.send(key);
            });
        };
        info!(handlers = handlers.len(), concurrency = self.concurrency, queue_cap = self.queue_cap, "dispatcher started");

        let mut closed = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(key) = done_rx.recv() => {
                    match busy.get_mut(&key).and_then(VecDeque::pop_front) {
                        Some(t) => ready.push_back((key, t)),
                        None => { busy.remove(&key); }
                    }
                }
                permit = Arc::clone(&limit).acquire_owned(), if !ready.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some((key, t)) = ready.pop_front() {
                        queued -= 1;
                        spawn(key, t, permit);
                    }
                }
                next = rx.recv(), if !closed && queued < self.queue_cap => match next {
                    None => closed = true,
                    Some(t) => {
                        let Some(key) = t.key() else {
                            warn!(verb = t.verb(), "dropping transition without identity");
                            continue;
                        };
                        queued += 1;
                        match busy.get_mut(&key) {
                            Some(backlog) => backlog.push_back(t),
                            None => {
                                busy.insert(key.clone(), VecDeque::new());
                                ready.push_back((key, t));
                            }
                        }
                    }
                },
            }
            if closed && busy.is_empty() {
                break;
            }
        }

        if queued > 0 {
            debug!(dropped = queued, "dispatcher cancelled with undelivered backlog");
        }
        info!("dispatcher stopped");
    }
}

async fn invoke(h: Arc<dyn ResourceEventHandler>, key: &ObjectKey, t: Transition) {
    let verb = t.verb();
    let handler = Arc::clone(&h);
    // Run on its own task so a panicking handler cannot wedge the key.
    let joined = tokio::spawn(async move {
        match t {
            Transition::Add(obj) => handler.on_add(obj).await,
            Transition::Update { old, new } => handler.on_update(old, new).await,
            Transition::Delete(obj) => handler.on_delete(obj).await,
        }
    })
    .await;
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            counter!("dispatch_handler_errors", 1u64);
            warn!(handler = h.name(), key = %key, verb, error = %format!("{e:#}"), "handler failed");
        }
        Err(e) => {
            counter!("dispatch_handler_errors", 1u64);
            error!(handler = h.name(), key = %key, verb, error = %e, "handler panicked");
        }
    }
}
