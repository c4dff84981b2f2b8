#![forbid(unsafe_code)]

use unpin_core::{FeedEvent, ObjectKey, Transition};
use unpin_kubehub::fake::{deployment, pinned};
use unpin_store::CacheWriter;

fn with_rv(mut d: k8s_openapi::api::apps::v1::Deployment, rv: u64) -> k8s_openapi::api::apps::v1::Deployment {
    d.metadata.resource_version = Some(rv.to_string());
    d
}

fn shape(ts: &[Transition]) -> Vec<(String, String)> {
    ts.iter()
        .map(|t| (t.verb().to_string(), t.key().map(|k| k.to_string()).unwrap_or_default()))
        .collect()
}

#[test]
fn relist_then_incremental_sequence() {
    let (mut w, r) = CacheWriter::new();
    assert!(!r.has_synced());

    let ts = w.apply(FeedEvent::Relisted(vec![
        with_rv(deployment("default", "a", None), 1),
        with_rv(deployment("default", "b", None), 2),
    ]));
    assert_eq!(shape(&ts), vec![("add".into(), "default/a".into()), ("add".into(), "default/b".into())]);
    assert!(r.has_synced());
    assert_eq!(r.len(), 2);

    let ts = w.apply(FeedEvent::Modified(with_rv(pinned("default", "a", false), 3)));
    match &ts[..] {
        [Transition::Update { old, new }] => {
            assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
            assert_eq!(new.metadata.resource_version.as_deref(), Some("3"));
        }
        other => panic!("expected one update, got {:?}", shape(other)),
    }
    assert_eq!(r.resource_version(&ObjectKey::new("default", "a")).as_deref(), Some("3"));

    // Added for an unknown key is an add; Modified for an unknown key too.
    let ts = w.apply(FeedEvent::Modified(with_rv(deployment("other", "c", None), 4)));
    assert_eq!(shape(&ts), vec![("add".into(), "other/c".into())]);

    let ts = w.apply(FeedEvent::Deleted(with_rv(deployment("default", "b", None), 5)));
    assert_eq!(shape(&ts), vec![("delete".into(), "default/b".into())]);
    assert_eq!(r.keys(), vec![ObjectKey::new("default", "a"), ObjectKey::new("other", "c")]);
    assert_eq!(r.epoch(), 4);
}

#[test]
fn relist_replaces_contents_and_reports_vanished_keys() {
    let (mut w, r) = CacheWriter::new();
    w.apply(FeedEvent::Relisted(vec![
        with_rv(deployment("default", "keep", None), 1),
        with_rv(deployment("default", "gone", None), 2),
    ]));
    let ts = w.apply(FeedEvent::Relisted(vec![
        with_rv(deployment("default", "keep", None), 7),
        with_rv(deployment("default", "new", None), 8),
    ]));
    assert_eq!(
        shape(&ts),
        vec![
            ("update".into(), "default/keep".into()),
            ("add".into(), "default/new".into()),
            ("delete".into(), "default/gone".into()),
        ]
    );
    assert!(r.get(&ObjectKey::new("default", "gone")).is_none());
    assert_eq!(r.len(), 2);
}

#[test]
fn resync_redelivers_every_object_unchanged() {
    let (mut w, _r) = CacheWriter::new();
    w.apply(FeedEvent::Relisted(vec![
        with_rv(deployment("b", "x", None), 1),
        with_rv(deployment("a", "y", None), 2),
    ]));
    let ts = w.apply(FeedEvent::Resync);
    assert_eq!(shape(&ts), vec![("update".into(), "a/y".into()), ("update".into(), "b/x".into())]);
    for t in ts {
        match t {
            Transition::Update { old, new } => assert!(std::sync::Arc::ptr_eq(&old, &new)),
            _ => panic!("resync must only produce updates"),
        }
    }
}

#[test]
fn delete_of_unknown_key_still_notifies() {
    let (mut w, _r) = CacheWriter::new();
    let ts = w.apply(FeedEvent::Deleted(with_rv(deployment("default", "ghost", None), 9)));
    assert_eq!(shape(&ts), vec![("delete".into(), "default/ghost".into())]);
}

#[test]
fn nameless_objects_are_skipped() {
    let (mut w, r) = CacheWriter::new();
    let mut bad = deployment("default", "x", None);
    bad.metadata.name = None;
    assert!(w.apply(FeedEvent::Added(bad.clone())).is_empty());
    let ts = w.apply(FeedEvent::Relisted(vec![bad]));
    assert!(ts.is_empty());
    assert!(r.has_synced());
    assert!(r.is_empty());
}

#[test]
fn snapshots_are_stable_while_writer_moves_on() {
    let (mut w, r) = CacheWriter::new();
    w.apply(FeedEvent::Relisted(vec![with_rv(deployment("default", "a", None), 1)]));
    let before = r.snapshot();
    w.apply(FeedEvent::Modified(with_rv(pinned("default", "a", false), 2)));
    let key = ObjectKey::new("default", "a");
    assert_eq!(before.items[&key].metadata.resource_version.as_deref(), Some("1"));
    assert_eq!(r.get(&key).and_then(|o| o.metadata.resource_version.clone()).as_deref(), Some("2"));
}

#[test]
fn staged_events_are_invisible_until_published() {
    let (mut w, r) = CacheWriter::new();
    let ts = w.stage(FeedEvent::Relisted(vec![with_rv(deployment("default", "a", None), 1)]));
    assert_eq!(ts.len(), 1);
    w.stage(FeedEvent::Added(with_rv(deployment("default", "b", None), 2)));
    assert!(r.is_empty());
    assert!(!r.has_synced(), "sync is reported with the snapshot, not before");

    w.publish();
    assert_eq!(r.len(), 2);
    assert_eq!(r.epoch(), 1);
    assert!(r.has_synced());
}
