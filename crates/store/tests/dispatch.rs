#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use unpin_core::{resource_version, ObjectKey, ResourceEventHandler, Transition};
use unpin_kubehub::fake::deployment;
use unpin_store::Dispatcher;

fn at(ns: &str, name: &str, rv: u64) -> Arc<Deployment> {
    let mut d = deployment(ns, name, None);
    d.metadata.resource_version = Some(rv.to_string());
    Arc::new(d)
}

fn label(o: &Deployment) -> String {
    format!("{}@{}", ObjectKey::from_object(o).expect("key"), resource_version(o).unwrap_or("-"))
}

/// Records every delivery; sleeps a little per call to widen races.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    async fn track(&self, entry: String) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.seen.lock().unwrap().push(entry);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn seen(&self) -> Vec<String> { self.seen.lock().unwrap().clone() }
}

#[async_trait]
impl ResourceEventHandler for Recorder {
    async fn on_add(&self, obj: Arc<Deployment>) -> anyhow::Result<()> {
        self.track(format!("add {}", label(&obj))).await;
        Ok(())
    }

    async fn on_update(&self, old: Arc<Deployment>, new: Arc<Deployment>) -> anyhow::Result<()> {
        self.track(format!("update {}->{}", label(&old), label(&new))).await;
        Ok(())
    }

    async fn on_delete(&self, obj: Arc<Deployment>) -> anyhow::Result<()> {
        self.track(format!("delete {}", label(&obj))).await;
        Ok(())
    }
}

struct Flaky;

#[async_trait]
impl ResourceEventHandler for Flaky {
    fn name(&self) -> &str { "flaky" }

    async fn on_add(&self, obj: Arc<Deployment>) -> anyhow::Result<()> {
        match obj.metadata.name.as_deref() {
            Some("boom") => anyhow::bail!("handler exploded"),
            Some("panic") => panic!("handler panicked"),
            _ => Ok(()),
        }
    }
}

/// Never returns from a notification.
struct Stuck;

#[async_trait]
impl ResourceEventHandler for Stuck {
    async fn on_add(&self, _obj: Arc<Deployment>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

async fn run_all(d: Dispatcher, ts: Vec<Transition>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(d.run(rx, CancellationToken::new()));
    for t in ts {
        tx.send(t).await.expect("send");
    }
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("dispatcher drains").expect("join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_key_order_is_preserved_under_concurrency() {
    let rec = Arc::new(Recorder::default());
    let mut d = Dispatcher::new(8);
    d.register(rec.clone());

    let mut ts = Vec::new();
    for key in ["a", "b", "c"] {
        ts.push(Transition::Add(at("default", key, 1)));
        for rv in 2..6 {
            ts.push(Transition::Update { old: at("default", key, rv - 1), new: at("default", key, rv) });
        }
        ts.push(Transition::Delete(at("default", key, 6)));
    }
    run_all(d, ts).await;

    let seen = rec.seen();
    assert_eq!(seen.len(), 18);
    for key in ["a", "b", "c"] {
        let mine: Vec<_> = seen.iter().filter(|s| s.contains(&format!("default/{key}@"))).cloned().collect();
        let expected: Vec<String> = std::iter::once(format!("add default/{key}@1"))
            .chain((2..6).map(|rv| format!("update default/{key}@{}->default/{key}@{rv}", rv - 1)))
            .chain(std::iter::once(format!("delete default/{key}@6")))
            .collect();
        assert_eq!(mine, expected, "per-key order for {key}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_never_runs_concurrently() {
    let rec = Arc::new(Recorder::default());
    let mut d = Dispatcher::new(8);
    d.register(rec.clone());
    let ts = (1..10).map(|rv| Transition::Update { old: at("ns", "one", rv), new: at("ns", "one", rv) }).collect();
    run_all(d, ts).await;
    assert_eq!(rec.peak.load(Ordering::SeqCst), 1);
    assert_eq!(rec.seen().len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_are_bounded_by_concurrency_limit() {
    let rec = Arc::new(Recorder::default());
    let mut d = Dispatcher::new(2);
    d.register(rec.clone());
    let ts = (0..12).map(|i| Transition::Add(at("ns", &format!("d{i}"), 1))).collect();
    run_all(d, ts).await;
    assert_eq!(rec.seen().len(), 12);
    assert!(rec.peak.load(Ordering::SeqCst) <= 2, "peak {}", rec.peak.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_errors_and_panics_do_not_stop_delivery() {
    let rec = Arc::new(Recorder::default());
    let mut d = Dispatcher::new(4);
    d.register(Arc::new(Flaky)).register(rec.clone());
    let ts = vec![
        Transition::Add(at("ns", "boom", 1)),
        Transition::Add(at("ns", "panic", 1)),
        Transition::Add(at("ns", "fine", 1)),
        Transition::Delete(at("ns", "panic", 2)),
    ];
    run_all(d, ts).await;
    let mut seen = rec.seen();
    seen.sort();
    assert_eq!(seen, vec!["add ns/boom@1", "add ns/fine@1", "add ns/panic@1", "delete ns/panic@2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_dispatch_and_in_flight_drains() {
    let rec = Arc::new(Recorder::default());
    let mut d = Dispatcher::new(1);
    d.register(rec.clone());
    let in_flight = d.in_flight();
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(d.run(rx, cancel.clone()));
    tx.send(Transition::Add(at("ns", "x", 1))).await.expect("send");
    tokio::time::sleep(Duration::from_millis(1)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.expect("stops").expect("join");
    assert!(in_flight.drain(Duration::from_secs(1)).await);
    assert!(in_flight.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_dispatcher_pushes_back_on_the_sender() {
    let mut d = Dispatcher::new(1).with_queue_cap(1);
    d.register(Arc::new(Stuck));
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(d.run(rx, cancel.clone()));

    let mut blocked_at = None;
    for i in 0..50 {
        let t = Transition::Add(at("ns", &format!("d{i}"), 1));
        if tokio::time::timeout(Duration::from_millis(100), tx.send(t)).await.is_err() {
            blocked_at = Some(i);
            break;
        }
    }
    // One running, one waiting for a permit, one in the channel buffer.
    let blocked_at = blocked_at.expect("sender must block once the dispatcher is saturated");
    assert!(blocked_at <= 4, "accepted {blocked_at} transitions before blocking");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.expect("stops").expect("join");
}
